#![no_main]
use libfuzzer_sys::fuzz_target;
use sip_core::ViaHeader;

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 || data.len() > 512 {
        return;
    }
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    if let Some(via) = ViaHeader::parse(s) {
        let _ = via.sent_by();
        let _ = ViaHeader::parse(&via.to_string());
    }
});

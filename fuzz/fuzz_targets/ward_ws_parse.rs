#![no_main]

use libfuzzer_sys::fuzz_target;
use ward_gateway::ws_protocol::{
    best_effort_ward_ws_request_id, build_ward_ws_error_frame, classify_ward_ws_parse_error,
    parse_optional_string_list, parse_ward_ws_request_frame,
};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let maybe_request_id = best_effort_ward_ws_request_id(&raw);

    match parse_ward_ws_request_frame(&raw) {
        Ok(frame) => {
            assert!(!frame.request_id.trim().is_empty());
            assert!(!frame.kind.response_kind().is_empty());
            if let Ok(Some(targets)) = parse_optional_string_list(&frame.payload, "targets") {
                assert!(targets.iter().all(|target| target.trim() == target));
            }
        }
        Err(error) => {
            let code = classify_ward_ws_parse_error(&error.to_string());
            assert!(!code.trim().is_empty());
            let request_id = maybe_request_id.as_deref().unwrap_or("fuzz-request");
            let error_frame = build_ward_ws_error_frame(request_id, code, &error.to_string());
            assert_eq!(error_frame.kind, "error");
            assert!(!error_frame.request_id.trim().is_empty());
        }
    }
});

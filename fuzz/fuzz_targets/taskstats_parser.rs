#![no_main]

use libfuzzer_sys::fuzz_target;
use topfast::source::taskstats::{parse_ack, parse_exit_events, parse_family_id, parse_taskstats};

fuzz_target!(|data: &[u8]| {
    // Kernel datagrams are untrusted input: decoding may fail but never panic
    let _ = parse_exit_events(data, 0x17);
    let _ = parse_family_id(data);
    let _ = parse_ack(data);
    let _ = parse_taskstats(data);
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use ptflow_codec::{Config, Encoder, Error, Packet, PacketDecoder};

fuzz_target!(|data: &[u8]| {
    let mut decoder = PacketDecoder::new(Config::new(data));
    if decoder.sync_forward().is_err() {
        return;
    }

    let mut scratch = vec![0u8; 16];
    loop {
        let packet = match decoder.next() {
            Ok(packet) => packet,
            Err(Error::Eos) => break,
            Err(_) => {
                // Skip behind garbage and try the next sync point.
                if decoder.sync_forward().is_err() {
                    break;
                }
                continue;
            }
        };
        let _ = std::hint::black_box(packet.size());

        // Every decoded packet must re-encode to the bytes it came from.
        if !matches!(packet, Packet::Unknown(_)) {
            let mut encoder = Encoder::new(&mut scratch);
            let written = encoder.next(&packet).expect("decoded packets re-encode");
            assert_eq!(written, packet.size());
        }
    }
});

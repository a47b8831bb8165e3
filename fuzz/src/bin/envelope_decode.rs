#[macro_use]
extern crate afl;
use sealed_session::MessageEnvelope;

fn main() {
    fuzz!(|data: &[u8]| {
        if let Ok(envelope) = MessageEnvelope::from_bytes(data) {
            // Anything that parses must encode back to the same bytes
            assert_eq!(envelope.to_bytes().ok().as_deref(), Some(data));
        }
    });
}

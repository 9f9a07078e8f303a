//! Stdin as an interrupt source.
//!
//! On the target this system was modeled after, a serial receive interrupt
//! delivers one byte at a time and the handler re-arms reception before it
//! returns. On the host, a dedicated thread blocked on stdin plays that part:
//! every byte is handed to the handler, and going back around the loop is the
//! re-arm.

use std::io::{self, Read};
use std::thread::JoinHandle;

use log::warn;

/// The byte that fires the demo burst action. Any other byte is ignored by
/// the demo handlers.
pub const TRIGGER_BYTE: u8 = b'r';

/// Spawn the pump thread. `handler` runs on that thread for every byte read
/// from stdin, so it must only do non-blocking work.
///
/// The thread stops at end of input; the rest of the demo keeps running
/// without a trigger source.
pub fn spawn_pump<F>(handler: F) -> JoinHandle<()>
where
    F: FnMut(u8) + Send + 'static,
{
    std::thread::spawn(move || pump(io::stdin().lock(), handler))
}

fn pump<R, F>(mut source: R, mut handler: F)
where
    R: Read,
    F: FnMut(u8),
{
    let mut byte = [0u8; 1];

    loop {
        match source.read(&mut byte) {
            // End of input, the event source is gone.
            Ok(0) => break,
            Ok(_) => handler(byte[0]),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("trigger pump stopped: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn pump_delivers_every_byte_then_stops() {
        let mut seen = Vec::new();

        pump(Cursor::new(b"xrry"), |b| seen.push(b));

        assert_eq!(seen, b"xrry");
    }
}

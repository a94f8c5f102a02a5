//! `traffic_logger` data listener: dumps every block to a file.
//!
//! File name: `<dir>/<rule-uuid>_<unix-millis>_<connection-id>.dump`.
//!
//! Blocks are copied onto a channel and written by a dedicated thread, so the
//! relay path never waits on the disk. The writer flushes whenever the channel
//! runs dry and exits once the listener is dropped.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::buffer::MessageBlock;
use crate::tunnel::listener::{DataTransferCommand, Listener, ListenerContext};

/// Packets queued for the writer before new ones are dropped.
const WRITE_QUEUE_DEPTH: usize = 4096;

struct Packet {
    at: u128,
    data: Bytes,
}

pub struct TrafficLogger {
    path: PathBuf,
    packets: Option<Sender<Packet>>,
    overflowed: AtomicBool,
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

impl TrafficLogger {
    pub const NAME: &'static str = "traffic_logger";

    /// Open the dump file and start its writer. Failures are logged and leave
    /// a listener that only passes data through.
    pub fn create(context: &ListenerContext, dir: &str) -> Self {
        let path = Path::new(dir).join(format!(
            "{}_{}_{}.dump",
            context.rule,
            unix_millis(),
            context.connection.as_u64()
        ));
        let packets = match Self::open(&path, context).and_then(|file| Self::spawn_writer(&path, file)) {
            Ok(packets) => Some(packets),
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "Could not open file for packets dumping");
                None
            }
        };
        Self {
            path,
            packets,
            overflowed: AtomicBool::new(false),
        }
    }

    fn open(path: &Path, context: &ListenerContext) -> std::io::Result<BufWriter<File>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = BufWriter::new(File::create(path)?);
        write!(
            file,
            "Packets dump-file: rule \"{}\", connection \"{}\", started at {}.\r\n\r\n",
            context.rule,
            context.connection,
            unix_millis()
        )?;
        file.flush()?;
        Ok(file)
    }

    fn spawn_writer(path: &Path, file: BufWriter<File>) -> std::io::Result<Sender<Packet>> {
        let (tx, rx) = channel::bounded(WRITE_QUEUE_DEPTH);
        let path = path.to_path_buf();
        thread::Builder::new()
            .name("traffic-logger".to_string())
            .spawn(move || write_packets(&path, file, &rx))?;
        Ok(tx)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_packets(path: &Path, mut file: BufWriter<File>, packets: &Receiver<Packet>) {
    let write = |file: &mut BufWriter<File>, packet: &Packet| -> std::io::Result<()> {
        write!(file, "-- Packet begin -- {} -- {:>16} bytes --\r\n", packet.at, packet.data.len())?;
        file.write_all(&packet.data)?;
        file.write_all(b"\r\n-- Packet end -------------------------------------------------------------\r\n\r\n")?;
        if packets.is_empty() {
            file.flush()?;
        }
        Ok(())
    };
    while let Ok(packet) = packets.recv() {
        if let Err(err) = write(&mut file, &packet) {
            tracing::error!(path = %path.display(), error = %err, "Packets dumping stopped");
            return;
        }
    }
    if let Err(err) = file.flush() {
        tracing::error!(path = %path.display(), error = %err, "Packets dump not flushed");
    }
}

impl Listener for TrafficLogger {
    fn on_new_message_block(&self, block: &MessageBlock) -> DataTransferCommand {
        if let Some(packets) = &self.packets {
            let packet = Packet {
                at: unix_millis(),
                data: Bytes::copy_from_slice(block.data()),
            };
            match packets.try_send(packet) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    if !self.overflowed.swap(true, Ordering::Relaxed) {
                        tracing::warn!(path = %self.path.display(), "Packets dump falls behind, dropping packets");
                    }
                }
            }
        }
        DataTransferCommand::Send
    }
}

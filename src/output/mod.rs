pub mod formatters;
pub mod senders;
pub mod sinks;

pub use formatters::{formatter_for, ConsoleFormatter, CsvFormatter, JsonFormatter, RecordFormatter};
pub use senders::{ConsoleSender, DataSender, FileSender};
pub use sinks::{spawn_writer, ChannelSink, LogSink};

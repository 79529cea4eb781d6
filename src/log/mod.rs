use std::sync::mpsc;

use crate::LogEntry;

mod file_log;

pub use file_log::{Log, LogLock};

/// Notified of every entry once it has been appended to the log and is
/// visible to readers. Called on the writing thread, after the write lock has
/// been released.
///
/// Entries of one batch arrive in batch order. Across concurrent writers there
/// is no such guarantee: two appends can be notified in the opposite order to
/// the one they hit the file in. An observer that needs the log's order has to
/// replay the file.
pub trait LogObserver<T>: Send + Sync {
    fn on_entry(&self, entry: &LogEntry<T>);
}

impl<T> LogObserver<T> for mpsc::Sender<LogEntry<T>>
where
    T: Clone + Send,
{
    fn on_entry(&self, entry: &LogEntry<T>) {
        // A dropped receiver just means nobody is listening anymore.
        if self.send(entry.clone()).is_err() {
            ::log::trace!("log subscriber hung up, dropping {:?}", entry.key);
        }
    }
}

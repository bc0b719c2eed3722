use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use tracing::{debug, trace};

use crate::{at::Params, codecs::lines::Line};

pub(crate) type UrcHandler = Arc<dyn Fn(&mut Urc) + Send + Sync>;

/// An unsolicited result code, as handed to its handler.
///
/// Dereferences to the [`Params`] after the prefix, so
/// `urc.read_int()` reads the first parameter.
#[derive(Debug)]
pub struct Urc {
    prefix: String,
    params: Params,
}

impl Urc {
    /// The prefix the handler was registered for.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Deref for Urc {
    type Target = Params;

    fn deref(&self) -> &Self::Target {
        &self.params
    }
}

impl DerefMut for Urc {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.params
    }
}

tokio::task_local! {
    /// Set while a URC handler runs.
    static IN_URC_HANDLER: ();
}

/// Whether the caller is (somewhere below) a URC handler.
pub(crate) fn in_urc_handler() -> bool {
    IN_URC_HANDLER.try_with(|_| ()).is_ok()
}

struct Entry {
    prefix: Vec<u8>,
    handler: UrcHandler,
}

/// Registered URC prefixes, in registration order.
#[derive(Default)]
pub(crate) struct UrcRegistry {
    entries: Vec<Entry>,
}

impl UrcRegistry {
    /// Register a handler.
    /// Returns true if an earlier handler for the same prefix was replaced.
    pub(crate) fn set(&mut self, prefix: &[u8], handler: UrcHandler) -> bool {
        match self.entries.iter_mut().find(|entry| entry.prefix == prefix) {
            Some(entry) => {
                entry.handler = handler;
                true
            }
            None => {
                self.entries.push(Entry {
                    prefix: prefix.to_vec(),
                    handler,
                });
                false
            }
        }
    }

    /// Returns false if there was no such prefix.
    pub(crate) fn remove(&mut self, prefix: &[u8]) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.prefix != prefix);

        self.entries.len() != before
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// The first handler whose prefix starts `text`, along with the prefix.
    pub(crate) fn matching(&self, text: &[u8]) -> Option<(Vec<u8>, UrcHandler)> {
        self.entries
            .iter()
            .find(|entry| text.starts_with(&entry.prefix))
            .map(|entry| (entry.prefix.clone(), entry.handler.clone()))
    }
}

/// `line` from just past its first `prefix_len` non-whitespace bytes.
pub(crate) fn after_prefix(line: &Line, prefix_len: usize) -> Line {
    let leading = line
        .bytes
        .iter()
        .take_while(|byte| byte.is_ascii_whitespace())
        .count();
    let start = (leading + prefix_len).min(line.bytes.len());

    Line {
        bytes: line.bytes.slice(start..),
        truncated: line.truncated,
    }
}

/// Run `handler` on a URC line which starts with `prefix`.
///
/// The handler runs with the URC marker set, so it can not start
/// an AT exchange.
pub(crate) fn run_handler(handler: &UrcHandler, prefix: &[u8], line: &Line, delimiter: u8) {
    let mut urc = Urc {
        prefix: String::from_utf8_lossy(prefix).into_owned(),
        params: Params::new(after_prefix(line, prefix.len()).bytes, delimiter),
    };

    trace!(prefix = %urc.prefix, "Running URC handler");

    IN_URC_HANDLER.sync_scope((), || handler(&mut urc));

    if !urc.is_empty() {
        debug!(
            "URC handler left parameters unread: {:?}",
            urc.remaining_lossy()
        );
    }
}

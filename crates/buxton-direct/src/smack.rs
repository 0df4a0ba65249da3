//! Smack-style access control: rule cache and the `may_access` primitive.
//!
//! Rules are loaded from a kernel-format rule list (`subject object
//! accesses` per line, access letters from `rwxat`, `-` for none). The
//! cache also exposes an inotify descriptor on the rules file so the
//! daemon's event loop can reload rules the moment they change.
//!
//! Built-in semantics sit in front of the cached rules: a subject always
//! accesses objects with its own label; the star object admits everyone;
//! the star subject is never admitted; the floor object (`_`) and the hat
//! subject (`^`) admit reads.

use std::collections::HashMap;
use std::fs;
use std::os::fd::{AsFd, BorrowedFd};

use camino::{Utf8Path, Utf8PathBuf};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use thiserror::Error;
use tracing::{debug, warn};

use buxton_proto::Label;

const SMACK_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::smack");

const FLOOR: &str = "_";
const STAR: &str = "*";
const HAT: &str = "^";

/// Access requested against a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Errors raised while loading rules or arming the change watch.
#[derive(Debug, Error)]
pub enum SmackError {
    /// The rules file exists but could not be read.
    #[error("failed to read rules from '{path}': {source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The inotify watch could not be created.
    #[error("failed to watch '{path}': {source}")]
    Watch {
        path: Utf8PathBuf,
        #[source]
        source: nix::Error,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct AccessBits {
    read: bool,
    write: bool,
}

impl AccessBits {
    fn parse(letters: &str) -> Self {
        let mut bits = Self::default();
        for letter in letters.chars() {
            match letter.to_ascii_lowercase() {
                'r' => bits.read = true,
                'w' | 'a' => bits.write = true,
                _ => {}
            }
        }
        bits
    }

    fn permits(self, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Read => self.read,
            AccessMode::Write => self.write,
        }
    }
}

/// Cached rule set with an optional change watch on the rules file.
pub struct SmackCache {
    rules_path: Utf8PathBuf,
    rules: HashMap<(String, String), AccessBits>,
    watch: Option<Inotify>,
}

impl SmackCache {
    /// Loads the rule set at `path`. A missing file yields an empty cache;
    /// the built-in label semantics still apply.
    #[must_use]
    pub fn load(path: impl Into<Utf8PathBuf>) -> Self {
        let mut cache = Self {
            rules_path: path.into(),
            rules: HashMap::new(),
            watch: None,
        };
        if let Err(error) = cache.reload() {
            warn!(target: SMACK_TARGET, %error, "rule load failed, cache left empty");
        }
        cache
    }

    /// Returns the rules file path.
    #[must_use]
    pub fn rules_path(&self) -> &Utf8Path {
        self.rules_path.as_path()
    }

    /// Re-reads the rules file, replacing the cached rule set.
    ///
    /// # Errors
    ///
    /// Returns [`SmackError::Read`] when the file exists but cannot be
    /// read. A missing file clears the cache and succeeds.
    pub fn reload(&mut self) -> Result<(), SmackError> {
        let text = match fs::read_to_string(&self.rules_path) {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                self.rules.clear();
                return Ok(());
            }
            Err(source) => {
                return Err(SmackError::Read {
                    path: self.rules_path.clone(),
                    source,
                });
            }
        };

        self.rules.clear();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let (Some(subject), Some(object), Some(letters)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            self.rules.insert(
                (subject.to_string(), object.to_string()),
                AccessBits::parse(letters),
            );
        }
        debug!(
            target: SMACK_TARGET,
            rules = self.rules.len(),
            "rule cache reloaded"
        );
        Ok(())
    }

    /// Arms an inotify watch on the rules file and returns its descriptor
    /// for the event loop to poll. Re-arming returns the existing
    /// descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`SmackError::Watch`] when inotify setup fails.
    pub fn watch_fd(&mut self) -> Result<BorrowedFd<'_>, SmackError> {
        if self.watch.is_none() {
            let watch_error = |source| SmackError::Watch {
                path: self.rules_path.clone(),
                source,
            };
            let inotify = Inotify::init(InitFlags::IN_NONBLOCK).map_err(watch_error)?;
            inotify
                .add_watch(
                    self.rules_path.as_std_path(),
                    AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_CLOSE_WRITE,
                )
                .map_err(watch_error)?;
            self.watch = Some(inotify);
        }
        Ok(self.watch.as_ref().unwrap().as_fd())
    }

    /// Discards any queued inotify events after a reload.
    pub fn drain_watch(&self) {
        if let Some(inotify) = &self.watch {
            while let Ok(events) = inotify.read_events() {
                if events.is_empty() {
                    break;
                }
            }
        }
    }

    /// Decides whether `subject` may access an object labelled `object`
    /// with the requested mode.
    #[must_use]
    pub fn may_access(&self, subject: &Label, object: &Label, mode: AccessMode) -> bool {
        let subject = subject.as_str();
        let object = object.as_str();

        if subject == STAR {
            return false;
        }
        if object == STAR || subject == object {
            return true;
        }
        if mode == AccessMode::Read && (object == FLOOR || subject == HAT) {
            return true;
        }

        self.rules
            .get(&(subject.to_string(), object.to_string()))
            .is_some_and(|bits| bits.permits(mode))
    }
}

impl std::fmt::Debug for SmackCache {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SmackCache")
            .field("rules_path", &self.rules_path)
            .field("rules", &self.rules.len())
            .field("watching", &self.watch.is_some())
            .finish()
    }
}

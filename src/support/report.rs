//-
// Copyright (c) 2015, 2016, Lavaboom Ltd
//
// This file is part of Lavamail.
//
// Lavamail is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU  General Public License  as published by  the Free
// Software Foundation, either version 3  of the License, or (at your option)
// any later version.
//
// Lavamail is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even  the implied warranty  of MERCHANTABILITY  or
// FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Lavamail. If not, see <http://www.gnu.org/licenses/>.

//! Crash and error reporting.
//!
//! The actual transport (Sentry et al) lives outside this process's
//! responsibilities; `Reporter` is the boundary it is wired through. The
//! in-tree implementation writes structured log lines, which is also what
//! deployments without a DSN get.

use std::panic::{self, AssertUnwindSafe};

use log::error;

/// Receives non-fatal errors and captured panics, with key-value tags
/// attached (e.g. the email ID a send failure belongs to).
pub trait Reporter: Send + Sync {
    fn capture_error(&self, message: &str, tags: &[(&str, &str)]);

    fn capture_panic(&self, info: &str, tags: &[(&str, &str)]);
}

/// `Reporter` that writes to the log.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn capture_error(&self, message: &str, tags: &[(&str, &str)]) {
        error!("captured error: {} {}", message, format_tags(tags));
    }

    fn capture_panic(&self, info: &str, tags: &[(&str, &str)]) {
        error!("captured panic: {} {}", info, format_tags(tags));
    }
}

fn format_tags(tags: &[(&str, &str)]) -> String {
    tags.iter()
        .map(|&(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs `f`, capturing any panic to `reporter` instead of unwinding further.
///
/// Returns `None` if `f` panicked. Used to confine a crashing connection
/// handler to its own connection.
pub fn capture_panics<R>(
    reporter: &dyn Reporter,
    tags: &[(&str, &str)],
    f: impl FnOnce() -> R,
) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => Some(r),
        Err(e) => {
            let info = if let Some(s) = e.downcast_ref::<&str>() {
                (*s).to_owned()
            } else if let Some(s) = e.downcast_ref::<String>() {
                s.clone()
            } else {
                "opaque panic payload".to_owned()
            };
            reporter.capture_panic(&info, tags);
            None
        },
    }
}

#[cfg(test)]
pub mod test_support {
    use std::sync::Mutex;

    use super::*;

    /// `Reporter` that records everything it is given.
    #[derive(Default)]
    pub struct RecordingReporter {
        pub errors: Mutex<Vec<String>>,
        pub panics: Mutex<Vec<String>>,
    }

    impl Reporter for RecordingReporter {
        fn capture_error(&self, message: &str, _tags: &[(&str, &str)]) {
            self.errors.lock().unwrap().push(message.to_owned());
        }

        fn capture_panic(&self, info: &str, _tags: &[(&str, &str)]) {
            self.panics.lock().unwrap().push(info.to_owned());
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_support::RecordingReporter;
    use super::*;

    #[test]
    fn capture_panics_returns_value_on_success() {
        let reporter = RecordingReporter::default();
        assert_eq!(Some(42), capture_panics(&reporter, &[], || 42));
        assert!(reporter.panics.lock().unwrap().is_empty());
    }

    #[test]
    fn capture_panics_captures_payload() {
        let reporter = RecordingReporter::default();
        let result =
            capture_panics(&reporter, &[], || -> i32 { panic!("boom") });
        assert_eq!(None, result);
        assert_eq!(vec!["boom".to_owned()], *reporter.panics.lock().unwrap());
    }
}

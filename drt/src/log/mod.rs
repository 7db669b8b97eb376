//! The implementation of the `DRT_LOG` environment variable.

use crate::{
    abi::Abi,
    codecache::CodeBlob,
    masm::disassemble,
};
use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

pub(crate) mod stats;

/// How verbose should the runtime's logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings (e.g. a stack guard zone being disabled).
    Warning,
    /// Log each frame deoptimized and each frame unpacked.
    Deopt,
    /// Log the creation of adapters, native wrappers and runtime stubs.
    Stub,
}

pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. A value of `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    /// Read the log configuration from `DRT_LOG`, which has the format `[<path|->:]<level>`.
    pub(crate) fn from_env() -> Result<Self, Box<dyn Error>> {
        match env::var("DRT_LOG") {
            Ok(s) => Self::parse(&s),
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // Truncate any existing log so that later appends don't mix with a previous
                    // run.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => return Err("DRT_LOG must be of the format `[<path|->:]<level>`".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid DRT_LOG level '{s}': {e}"))?;
        // This can only fail if the types are wrong statically.
        let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("DRT_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self { path, level })
    }

    pub(crate) fn with_level(level: Verbosity) -> Self {
        Self { path: None, level }
    }

    /// Would a message at `level` be written anywhere?
    pub(crate) fn enabled(&self, level: Verbosity) -> bool {
        level != Verbosity::Disabled && level <= self.level
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "drt-error",
                Verbosity::Warning => "drt-warning",
                Verbosity::Deopt => "drt-deopt",
                Verbosity::Stub => "drt-stub",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    eprintln!("{prefix}: {msg}");
                }
            }
        }
    }

    /// Log the placement and listing of a newly installed blob.
    pub(crate) fn log_blob(&self, abi: &Abi, b: &CodeBlob) {
        if self.enabled(Verbosity::Stub) {
            self.log(
                Verbosity::Stub,
                &format!(
                    "{} [{:#x}, {:#x}) frame_size={}\n{}",
                    b.name(),
                    b.code_begin(),
                    b.code_end(),
                    b.frame_size(),
                    disassemble(abi, b.code())
                ),
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    #[test]
    fn parse_levels() {
        assert_eq!(Log::parse("3").unwrap().level, Verbosity::Deopt);
        assert_eq!(Log::parse("-:4").unwrap().level, Verbosity::Stub);
        assert!(Log::parse("-:4").unwrap().path.is_none());
        assert!(Log::parse("9").is_err());
        assert!(Log::parse("a:b:c").is_err());
        assert!(Log::parse("x").is_err());
    }

    #[test]
    fn log_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("drt.log");
        let log = Log::parse(&format!("{}:3", p.display())).unwrap();
        log.log(Verbosity::Deopt, "unpacked 3 frames");
        log.log(Verbosity::Stub, "not written");
        log.log(Verbosity::Error, "bad");
        let got = fs::read_to_string(&p).unwrap();
        let ptn = "drt-deopt: unpacked 3 frames\ndrt-error: bad\n";
        assert_eq!(got, ptn);
        assert!(log.enabled(Verbosity::Warning));
        assert!(!log.enabled(Verbosity::Stub));
    }
}

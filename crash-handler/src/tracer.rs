// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Delegating a crash to a secondary tracer tool.
//!
//! The tracer's command line is assembled from the handler's annotation dictionary. Besides
//! plain key/value annotations, which are forwarded as `--kv=<key>:<value>`, three kinds of
//! keys act as directives:
//!
//! * `--additional-tracer-opt=<opt>=<val>` sets the tracer option `<opt>` to `<val>`,
//!   replacing a default argument with the same option name;
//! * `--additional-tracer=<path>` runs the tracer at `<path>` instead of the default one;
//! * `_mod_faulting_tid` forwards its value as `--fault-thread=<value>`.

use std::collections::HashMap;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crash_handler_common::{
    ChildExit, LaunchError, ProcessId, ProcessLauncher, SimpleStringDictionary,
};
use tracing::{debug, info};

pub const ADDITIONAL_TRACER_OPT_PREFIX: &str = "--additional-tracer-opt";
pub const ADDITIONAL_TRACER_PREFIX: &str = "--additional-tracer";
pub const FAULTING_TID_PREFIX: &str = "_mod_faulting_tid";
/// The extension of the tracer's output file, which sits next to the minidump.
pub const TRACER_OUTPUT_EXTENSION: &str = "btt";

/// Errors encountered while building a tracer command line.
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum TracerParameterError {
    #[error("the annotation dictionary holds no key/value annotations for the tracer")]
    EmptyAnnotations,
}

/// Errors encountered while running the tracer.
#[derive(Debug, thiserror::Error)]
pub enum TracerError {
    #[error(transparent)]
    Parameters(#[from] TracerParameterError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("tracer terminated abnormally: {0:?}")]
    AbnormalExit(ChildExit),
    #[error("upload of the tracer report did not finish within {0:?}")]
    UploadTimedOut(Duration),
}

/// A fully assembled tracer command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracerInvocation {
    pub tracer: PathBuf,
    /// Arguments after `argv[0]`, ending with the tracee's process id.
    pub args: Vec<String>,
    pub tracee: ProcessId,
    pub output: Option<PathBuf>,
}

impl TracerInvocation {
    /// The complete argument vector, with the tracer path as `argv[0]`.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.tracer.to_string_lossy().into_owned());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// The part of `s` after its first `=`, or all of `s` if it has none.
fn after_first_equals(s: &str) -> &str {
    s.split_once('=').map_or(s, |(_, rest)| rest)
}

/// The part of `s` before its first `=`, or all of `s` if it has none.
fn before_first_equals(s: &str) -> &str {
    s.split_once('=').map_or(s, |(name, _)| name)
}

/// Build the tracer command line from `annotations`, in the dictionary's insertion order.
///
/// Options named by `--additional-tracer-opt` keys are looked up among `default_args` only,
/// by the text before each argument's first `=`. Arguments appended along the way are never
/// replaced. Fails unless at least one annotation is forwarded as `--kv`.
pub fn make_additional_tracer_parameters(
    annotations: &SimpleStringDictionary,
    tracer: &Path,
    default_args: Vec<String>,
    tracee: ProcessId,
    output: Option<&Path>,
) -> Result<TracerInvocation, TracerParameterError> {
    let mut tracer = tracer.to_path_buf();
    let mut args = default_args;
    let positions = args
        .iter()
        .enumerate()
        .map(|(i, arg)| (before_first_equals(arg).to_owned(), i))
        .collect::<HashMap<_, _>>();
    let mut kv_count = 0;

    for (key, value) in annotations.iter() {
        if key.starts_with(ADDITIONAL_TRACER_OPT_PREFIX) {
            let option = after_first_equals(key);
            match positions.get(before_first_equals(option)) {
                Some(&i) => {
                    info!("replace tracer argument [{}] : {}", i, option);
                    args[i] = option.to_owned();
                }
                None => {
                    info!("add a tracer argument: {}", option);
                    args.push(option.to_owned());
                }
            }
        } else if key.starts_with(ADDITIONAL_TRACER_PREFIX) {
            tracer = PathBuf::from(after_first_equals(key));
            info!("replace tracer pathname: {}", tracer.display());
        } else if key.starts_with(FAULTING_TID_PREFIX) {
            args.push(format!("--fault-thread={}", value));
        } else {
            args.push(format!("--kv={}:{}", key, value));
            kv_count += 1;
        }
    }

    if kv_count == 0 {
        return Err(TracerParameterError::EmptyAnnotations);
    }

    if let Some(output) = output {
        args.push(format!("--output={}", output.display()));
    }
    args.push(tracee.to_string());
    debug!("tracer arguments: {:?}", args);

    Ok(TracerInvocation {
        tracer,
        args,
        tracee,
        output: output.map(Path::to_path_buf),
    })
}

/// Where the tracer writes its output for the report stored at `report_path`.
pub fn tracer_output_path(report_path: &Path) -> PathBuf {
    report_path.with_extension(TRACER_OUTPUT_EXTENSION)
}

/// Runs the tracer as a child process and blocks until it terminates.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForkExecLauncher;

impl ProcessLauncher for ForkExecLauncher {
    fn spawn_and_wait(&self, program: &Path, argv: &[String]) -> Result<ChildExit, LaunchError> {
        let mut command = Command::new(program);
        if let Some((arg0, args)) = argv.split_first() {
            command.arg0(arg0).args(args);
        }
        let mut child = command.spawn().map_err(LaunchError::Spawn)?;
        let status = child.wait().map_err(LaunchError::Wait)?;

        Ok(if let Some(code) = status.code() {
            ChildExit::Exited(code)
        } else if let Some(signal) = status.stopped_signal() {
            ChildExit::Stopped(signal)
        } else if let Some(signal) = status.signal() {
            ChildExit::Signaled(signal)
        } else {
            ChildExit::Unknown
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn args(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn build(
        annotations: &[(&str, &str)],
        default_args: &[&str],
    ) -> Result<TracerInvocation, TracerParameterError> {
        make_additional_tracer_parameters(
            &SimpleStringDictionary::from_iter(annotations.iter().copied()),
            Path::new("/usr/bin/tracer"),
            args(default_args),
            42,
            None,
        )
    }

    #[test]
    fn test_option_replaced_in_place() {
        let invocation = build(
            &[("--additional-tracer-opt=--foo=bar", ""), ("k", "v")],
            &["--first", "--foo=old", "--last"],
        )
        .unwrap();
        assert_eq!(
            invocation.args,
            args(&["--first", "--foo=bar", "--last", "--kv=k:v", "42"])
        );
    }

    #[test]
    fn test_unknown_option_appended() {
        let invocation = build(
            &[("k", "v"), ("--additional-tracer-opt=--depth=3", "")],
            &["--foo=old"],
        )
        .unwrap();
        assert_eq!(
            invocation.args,
            args(&["--foo=old", "--kv=k:v", "--depth=3", "42"])
        );
    }

    #[test]
    fn test_appended_options_are_not_replaced() {
        let invocation = build(
            &[
                ("--additional-tracer-opt=--depth=3", ""),
                ("--additional-tracer-opt=--depth=4", ""),
                ("k", "v"),
            ],
            &[],
        )
        .unwrap();
        assert_eq!(
            invocation.args,
            args(&["--depth=3", "--depth=4", "--kv=k:v", "42"])
        );
    }

    #[test]
    fn test_later_default_argument_wins_lookup() {
        let invocation = build(
            &[("--additional-tracer-opt=--foo=new", ""), ("k", "v")],
            &["--foo=a", "--foo=b"],
        )
        .unwrap();
        assert_eq!(
            invocation.args,
            args(&["--foo=a", "--foo=new", "--kv=k:v", "42"])
        );
    }

    #[test]
    fn test_fails_without_key_values() {
        assert_eq!(
            build(
                &[
                    ("--additional-tracer-opt=--foo=bar", ""),
                    ("--additional-tracer=/opt/tracer", ""),
                    ("_mod_faulting_tid", "7"),
                ],
                &["--foo=old"],
            ),
            Err(TracerParameterError::EmptyAnnotations)
        );
        assert_eq!(build(&[], &[]), Err(TracerParameterError::EmptyAnnotations));
    }

    #[test]
    fn test_tracer_path_override() {
        let invocation = build(
            &[
                ("--additional-tracer=/opt/first", ""),
                ("k", "v"),
                ("--additional-tracer=/opt/second", ""),
            ],
            &[],
        )
        .unwrap();
        assert_eq!(invocation.tracer, PathBuf::from("/opt/second"));
        assert_eq!(invocation.argv()[0], "/opt/second");
    }

    #[test]
    fn test_faulting_thread_and_output() {
        let invocation = make_additional_tracer_parameters(
            &SimpleStringDictionary::from_iter([("_mod_faulting_tid", "1234"), ("prod", "app")]),
            Path::new("/usr/bin/tracer"),
            args(&["--mode=full"]),
            99,
            Some(Path::new("/reports/abc.btt")),
        )
        .unwrap();
        assert_eq!(
            invocation.argv(),
            args(&[
                "/usr/bin/tracer",
                "--mode=full",
                "--fault-thread=1234",
                "--kv=prod:app",
                "--output=/reports/abc.btt",
                "99",
            ])
        );
        assert_eq!(invocation.tracee, 99);
    }

    #[test]
    fn test_output_path() {
        assert_eq!(
            tracer_output_path(Path::new("/db/pending/1234.dmp")),
            PathBuf::from("/db/pending/1234.btt")
        );
        assert_eq!(
            tracer_output_path(Path::new("/db/pending/1234")),
            PathBuf::from("/db/pending/1234.btt")
        );
    }

    #[test]
    fn test_fork_exec_exit_codes() {
        let sh = Path::new("/bin/sh");
        let exit = ForkExecLauncher
            .spawn_and_wait(sh, &args(&["sh", "-c", "exit 3"]))
            .unwrap();
        assert_eq!(exit, ChildExit::Exited(3));
        assert!(exit.exited_normally());

        let exit = ForkExecLauncher
            .spawn_and_wait(sh, &args(&["sh", "-c", "kill -9 $$"]))
            .unwrap();
        assert_eq!(exit, ChildExit::Signaled(9));
        assert!(!exit.exited_normally());
    }

    #[test]
    fn test_fork_exec_missing_program() {
        let result = ForkExecLauncher.spawn_and_wait(
            Path::new("/nonexistent/tracer"),
            &args(&["tracer"]),
        );
        assert!(matches!(result, Err(LaunchError::Spawn(_))));
    }
}

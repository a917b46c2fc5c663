use anyhow::{Context, Result, anyhow, bail};
use log::LevelFilter;
use std::path::PathBuf;

pub const USAGE: &str = "\
Usage: zotbin_rig [--config <file.json>] [--log-level <level>] <command>

Commands:
  calibrate [--known-grams <g>]            interactive tare + known-weight calibration
  read [--samples <n>] [--raw]             one averaged reading
  stream [--hz <f>] [--samples <n>] [--raw] JSON lines until interrupted
  replay <frames dir> [--out <dir>]        run one detection window over recorded frames
  run [<frames dir>] [--out <dir>]         full pipeline on the live camera, or on recorded frames;
                                           each line on stdin is a trigger";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Calibrate { known_grams: Option<f64> },
    Read { samples: Option<usize>, raw: bool },
    Stream { hz: f64, samples: Option<usize>, raw: bool },
    Replay { frames: PathBuf, out: PathBuf },
    /// `frames: None` means the live camera.
    Run { frames: Option<PathBuf>, out: PathBuf },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cli {
    pub config: Option<PathBuf>,
    pub log_level: LevelFilter,
    pub command: Command,
}

pub fn parse_log_level(value: &str) -> LevelFilter {
    match value.to_uppercase().as_str() {
        "OFF" => LevelFilter::Off,
        "ERROR" => LevelFilter::Error,
        "WARN" => LevelFilter::Warn,
        "INFO" => LevelFilter::Info,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        _ => {
            eprintln!("Unknown log level: {value}. Using INFO");
            LevelFilter::Info
        }
    }
}

fn value<I: Iterator<Item = String>>(args: &mut I, flag: &str) -> Result<String> {
    args.next().ok_or_else(|| anyhow!("{flag} needs a value"))
}

fn number<T, I>(args: &mut I, flag: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    I: Iterator<Item = String>,
{
    let raw = value(args, flag)?;
    raw.parse::<T>().with_context(|| format!("{flag}: cannot parse {raw:?}"))
}

/// Parses everything after the program name.
pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Cli> {
    let mut args = args.into_iter();
    let mut config = None;
    let mut log_level = LevelFilter::Info;
    let mut command_name = None;
    let mut positional: Vec<String> = Vec::new();

    let mut known_grams = None;
    let mut samples = None;
    let mut raw = false;
    let mut hz: f64 = 2.0;
    let mut out = PathBuf::from("captures");

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(value(&mut args, "--config")?)),
            "--log-level" => log_level = parse_log_level(&value(&mut args, "--log-level")?),
            "--known-grams" => known_grams = Some(number(&mut args, "--known-grams")?),
            "--samples" => samples = Some(number(&mut args, "--samples")?),
            "--hz" => hz = number(&mut args, "--hz")?,
            "--out" => out = PathBuf::from(value(&mut args, "--out")?),
            "--raw" => raw = true,
            "-h" | "--help" => bail!("{USAGE}"),
            flag if flag.starts_with("--") => bail!("unknown flag {flag}\n\n{USAGE}"),
            _ if command_name.is_none() => command_name = Some(arg),
            _ => positional.push(arg),
        }
    }

    let frames = || {
        positional
            .first()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("missing <frames dir>\n\n{USAGE}"))
    };
    let command = match command_name.as_deref() {
        Some("calibrate") => Command::Calibrate { known_grams },
        Some("read") => Command::Read { samples, raw },
        Some("stream") => Command::Stream {
            hz: hz.max(0.1),
            samples,
            raw,
        },
        Some("replay") => Command::Replay {
            frames: frames()?,
            out,
        },
        Some("run") => Command::Run {
            frames: positional.first().map(PathBuf::from),
            out,
        },
        Some(other) => bail!("unknown command {other}\n\n{USAGE}"),
        None => bail!("{USAGE}"),
    };

    Ok(Cli {
        config,
        log_level,
        command,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn global_flags_anywhere() {
        let cli = parse(args("stream --hz 5 --log-level debug --config rig.json --raw")).unwrap();
        assert_eq!(cli.log_level, LevelFilter::Debug);
        assert_eq!(cli.config, Some(PathBuf::from("rig.json")));
        assert_eq!(
            cli.command,
            Command::Stream {
                hz: 5.0,
                samples: None,
                raw: true
            }
        );
    }

    #[test]
    fn replay_needs_a_directory() {
        assert!(parse(args("replay")).is_err());
        let cli = parse(args("replay ./rec --out ./shots")).unwrap();
        assert_eq!(
            cli.command,
            Command::Replay {
                frames: PathBuf::from("./rec"),
                out: PathBuf::from("./shots")
            }
        );
    }

    #[test]
    fn run_defaults_to_the_live_camera() {
        let cli = parse(args("run")).unwrap();
        assert_eq!(
            cli.command,
            Command::Run {
                frames: None,
                out: PathBuf::from("captures")
            }
        );
        let cli = parse(args("run ./rec")).unwrap();
        assert!(matches!(cli.command, Command::Run { frames: Some(_), .. }));
    }

    #[test]
    fn bad_numbers_and_unknowns_are_errors() {
        assert!(parse(args("read --samples many")).is_err());
        assert!(parse(args("weigh")).is_err());
        assert!(parse(args("read --fast")).is_err());
        assert!(parse(Vec::<String>::new()).is_err());
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        assert_eq!(parse_log_level("chatty"), LevelFilter::Info);
        assert_eq!(parse_log_level("warn"), LevelFilter::Warn);
    }
}

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use gdcopy::config::CopyConfig;
use gdcopy::folder_ref::FolderId;
use gdcopy::report::ConsoleReporter;
use gdcopy::runtime::CopyRuntime;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

const DEFAULT_LOG_FILTER: &str = "warn";

const USAGE: &str = "\
Usage: gdcopy <source folder URL> <destination folder URL>
       gdcopy --download <file id> [local path]
  --download   Download one file (default target: tmp_path/<file name>)
  --help       Show this help";

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Copy {
        source: FolderId,
        destination: FolderId,
    },
    Download {
        file_id: String,
        target: Option<PathBuf>,
    },
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().skip(1).collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        return Ok(CliMode::Help);
    }

    match args.as_slice() {
        [flag, rest @ ..] if flag == "--download" => match rest {
            [file_id] => Ok(CliMode::Download {
                file_id: file_id.clone(),
                target: None,
            }),
            [file_id, target] => Ok(CliMode::Download {
                file_id: file_id.clone(),
                target: Some(PathBuf::from(target)),
            }),
            _ => anyhow::bail!("--download expects a file id and an optional local path"),
        },
        [other, ..] if other.starts_with('-') => anyhow::bail!("unknown argument: {other}"),
        [source, destination] => Ok(CliMode::Copy {
            source: FolderId::parse(source).context("invalid source folder URL")?,
            destination: FolderId::parse(destination)
                .context("invalid destination folder URL")?,
        }),
        _ => anyhow::bail!("expected a source and a destination folder URL"),
    }
}

fn init_tracing(log_path: Option<&Path>) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter);

    let file = match log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_filter(LevelFilter::WARN),
            )
        }
        None => None,
    };

    tracing_subscriber::registry().with(stderr).with(file).init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = match parse_cli_mode(std::env::args()) {
        Ok(CliMode::Help) => {
            println!("{USAGE}");
            return Ok(());
        }
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("{USAGE}");
            return Err(err);
        }
    };

    let config = CopyConfig::from_env().context("failed to load configuration")?;
    init_tracing(config.log_path.as_deref())?;
    let reporter = Arc::new(ConsoleReporter::stdout());
    let runtime = CopyRuntime::bootstrap(config, reporter.clone())?;

    match mode {
        CliMode::Copy {
            source,
            destination,
        } => {
            reporter.print_legend();
            match runtime.copy(&source, &destination).await {
                Ok(stats) => reporter.print_summary(&stats),
                Err(err) => {
                    reporter.finish_line();
                    return Err(err).context("copy aborted");
                }
            }
        }
        CliMode::Download { file_id, target } => {
            let (path, bytes) = runtime.download(&file_id, target.as_deref()).await?;
            println!("Downloaded {bytes} bytes to {}", path.display());
        }
        CliMode::Help => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "https://drive.google.com/drive/folders/1AbCdEfGhIjKlMnOpQrStUvWx_-9";
    const DEST: &str = "https://drive.google.com/drive/folders/0ZyXwVuTsRqPoNmLkJiHgFeDcB-_";

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("gdcopy")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_cli_mode_reads_folder_urls() {
        let mode = parse_cli_mode(args(&[SRC, DEST])).unwrap();
        assert_eq!(
            mode,
            CliMode::Copy {
                source: FolderId::parse(SRC).unwrap(),
                destination: FolderId::parse(DEST).unwrap(),
            }
        );
    }

    #[test]
    fn parse_cli_mode_rejects_bad_folder_url() {
        let err = parse_cli_mode(args(&[SRC, "https://drive.google.com/drive/folders/nope"]))
            .unwrap_err();
        assert!(err.to_string().contains("destination"));
    }

    #[test]
    fn parse_cli_mode_requires_two_folders() {
        assert!(parse_cli_mode(args(&[])).is_err());
        assert!(parse_cli_mode(args(&[SRC])).is_err());
        assert!(parse_cli_mode(args(&[SRC, DEST, SRC])).is_err());
    }

    #[test]
    fn parse_cli_mode_supports_download() {
        assert_eq!(
            parse_cli_mode(args(&["--download", "file-1", "out/a.bin"])).unwrap(),
            CliMode::Download {
                file_id: "file-1".into(),
                target: Some(PathBuf::from("out/a.bin")),
            }
        );
        assert_eq!(
            parse_cli_mode(args(&["--download", "file-1"])).unwrap(),
            CliMode::Download {
                file_id: "file-1".into(),
                target: None,
            }
        );
        assert!(parse_cli_mode(args(&["--download"])).is_err());
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        assert_eq!(parse_cli_mode(args(&["--help"])).unwrap(), CliMode::Help);
        assert_eq!(parse_cli_mode(args(&[SRC, "-h"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        let err = parse_cli_mode(args(&["--verbose", SRC])).unwrap_err();
        assert!(err.to_string().contains("--verbose"));
    }
}

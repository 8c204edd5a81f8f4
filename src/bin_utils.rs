use csv::Writer;
use log::LevelFilter;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn write_records(output: &Path, records: Vec<impl Serialize>) -> csv::Result<()> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|err| {
                csv::Error::from(io::Error::new(
                    err.kind(),
                    format!("Could not create dir {}: {}", parent.display(), err),
                ))
            })?;
        }
    }

    let mut writer = Writer::from_path(output)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Logs to stderr, at debug level if `debug` is set.
pub fn init_logging(debug: bool) -> Result<(), log::SetLoggerError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(if debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .chain(io::stderr())
        .apply()
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("output")
}

/// Output file named after `prefix` and the current time.
pub fn default_output_file(prefix: &str) -> PathBuf {
    default_output_dir().join(format!(
        "{}-{}.csv",
        prefix,
        chrono::Local::now().format("%FT%H%M%S%z")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Serialize)]
    struct Record {
        alias: String,
        rows: u64,
    }

    #[test]
    fn records_to_new_dir() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nested").join("out.csv");
        write_records(
            &output,
            vec![
                Record {
                    alias: "t1".to_string(),
                    rows: 3,
                },
                Record {
                    alias: "t2".to_string(),
                    rows: 7,
                },
            ],
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "alias,rows\nt1,3\nt2,7\n"
        );
    }

    #[test]
    fn output_file_has_prefix() {
        let file = default_output_file("explain-push");
        assert!(file.starts_with(default_output_dir()));
        assert!(file
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.starts_with("explain-push-") && name.ends_with(".csv")));
    }
}

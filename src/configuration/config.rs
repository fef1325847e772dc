use std::path::{Path, PathBuf};

use clap::Parser;
use log::debug;

use super::types::Settings;
use crate::error_handling::types::ConfigError;

/// Command-line configuration.
///
/// The database location may come from the `PCAP2DB_DATABASE` environment
/// variable instead of the flag; one of the two is required.
///
/// # Examples
///
/// ```no_run
/// use pcap2db::configuration::Configuration;
///
/// let config = Configuration::from_args();
/// config.validate().unwrap();
/// println!("Writing streams to {:?}", config.workdir);
/// ```
#[derive(Parser, Debug, Clone)]
#[command(name = "pcap2db")]
#[command(version)]
#[command(about = "Correlates captured flows and persists their payload streams")]
pub struct Configuration {
    /// Directory receiving one payload file per stream.
    #[arg(short = 'd', long)]
    pub workdir: PathBuf,

    /// pcap or pcapng capture to replay.
    #[arg(value_name = "CAPTURE_FILE")]
    pub capture_file: PathBuf,

    /// SQLite database holding flow metadata. Created if missing.
    #[arg(long, env = "PCAP2DB_DATABASE")]
    pub database: PathBuf,

    /// Optional TOML settings file.
    #[arg(short = 'c', long = "config")]
    pub config_file: Option<PathBuf>,
}

impl Configuration {
    /// Parses the process arguments, exiting with a usage message on error.
    pub fn from_args() -> Self {
        Configuration::parse()
    }

    /// Checks everything the run needs before any flow is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_workdir(&self.workdir)?;
        if !self.capture_file.is_file() {
            return Err(ConfigError::CaptureFileMissing(
                self.capture_file.display().to_string(),
            ));
        }
        Ok(())
    }

    /// Loads the settings file if one was given, defaults otherwise.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        match &self.config_file {
            Some(path) => {
                debug!("Reading settings from {:?}", path);
                Settings::from_file(path)
            }
            None => Ok(Settings::default()),
        }
    }
}

fn check_workdir(dir: &Path) -> Result<(), ConfigError> {
    if !dir.exists() {
        return Err(ConfigError::DirectoryDoesNotExist(format!(
            "{} does not exist",
            dir.display()
        )));
    }
    if !dir.is_dir() {
        return Err(ConfigError::DirectoryDoesNotExist(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    // Removed on drop.
    tempfile::tempfile_in(dir).map_err(|source| ConfigError::DirectoryNotWritable {
        path: dir.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    const DB_VAR: &str = "PCAP2DB_DATABASE";

    fn parse(args: &[&str]) -> Result<Configuration, clap::Error> {
        let mut argv = vec!["pcap2db"];
        argv.extend_from_slice(args);
        Configuration::try_parse_from(argv)
    }

    #[test]
    #[serial]
    fn parses_flags_and_positional() {
        std::env::remove_var(DB_VAR);
        let config = parse(&[
            "-d",
            "/tmp/work",
            "--database",
            "/tmp/flows.db",
            "-c",
            "/tmp/pcap2db.toml",
            "trace.pcap",
        ])
        .unwrap_or_else(|e| panic!("{}", e));

        assert_eq!(config.workdir, PathBuf::from("/tmp/work"));
        assert_eq!(config.capture_file, PathBuf::from("trace.pcap"));
        assert_eq!(config.database, PathBuf::from("/tmp/flows.db"));
        assert_eq!(config.config_file, Some(PathBuf::from("/tmp/pcap2db.toml")));
    }

    #[test]
    #[serial]
    fn database_comes_from_environment() {
        std::env::set_var(DB_VAR, "/var/lib/pcap2db/flows.db");
        let config = parse(&["--workdir", "/tmp", "trace.pcap"]);
        std::env::remove_var(DB_VAR);

        let config = config.unwrap_or_else(|e| panic!("{}", e));
        assert_eq!(config.database, PathBuf::from("/var/lib/pcap2db/flows.db"));
        assert_eq!(config.config_file, None);
    }

    #[test]
    #[serial]
    fn database_is_required() {
        std::env::remove_var(DB_VAR);
        let err = parse(&["--workdir", "/tmp", "trace.pcap"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    #[serial]
    fn workdir_is_required() {
        std::env::remove_var(DB_VAR);
        let err = parse(&["--database", "x.db", "trace.pcap"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    fn config_in(dir: &TempDir) -> Configuration {
        let capture = dir.path().join("trace.pcap");
        fs::write(&capture, b"").unwrap();
        Configuration {
            workdir: dir.path().join("streams"),
            capture_file: capture,
            database: dir.path().join("flows.db"),
            config_file: None,
        }
    }

    #[test]
    fn validate_accepts_writable_workdir() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        fs::create_dir(&config.workdir).unwrap();
        config.validate().unwrap();
        assert_eq!(fs::read_dir(&config.workdir).unwrap().count(), 0);
    }

    #[test]
    fn validate_rejects_missing_workdir() {
        let dir = TempDir::new().unwrap();
        let err = config_in(&dir).validate().unwrap_err();
        assert!(matches!(err, ConfigError::DirectoryDoesNotExist(_)));
    }

    #[test]
    fn validate_rejects_file_as_workdir() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        fs::write(&config.workdir, b"not a dir").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn validate_rejects_missing_capture() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        fs::create_dir(&config.workdir).unwrap();
        config.capture_file = dir.path().join("absent.pcap");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::CaptureFileMissing(_)));
    }

    #[test]
    fn settings_default_without_file() {
        let dir = TempDir::new().unwrap();
        assert_eq!(config_in(&dir).settings().unwrap(), Settings::default());
    }

    #[test]
    fn settings_read_from_given_file() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        let path = dir.path().join("pcap2db.toml");
        fs::write(&path, "[store]\nembed_payload = true\n").unwrap();
        config.config_file = Some(path);
        assert!(config.settings().unwrap().store.embed_payload);
    }
}

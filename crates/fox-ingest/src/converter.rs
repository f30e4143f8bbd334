//! Legacy `.xls` to `.xlsx` conversion through an external office suite.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::IngestError;

#[derive(Debug, Clone)]
pub struct Converter {
    program: Option<String>,
    timeout: Duration,
}

impl Converter {
    /// `program` of `none` (or empty) disables conversion; `.xls` files are
    /// then read directly.
    pub fn new(program: &str, timeout: Duration) -> Self {
        let program = program.trim();
        let program = (!program.is_empty() && !program.eq_ignore_ascii_case("none"))
            .then(|| program.to_string());
        Self { program, timeout }
    }

    pub fn disabled() -> Self {
        Self {
            program: None,
            timeout: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.program.is_some()
    }

    /// Converts `source` into an `.xlsx` next to it and returns that path.
    /// The source file is not touched.
    pub async fn convert(&self, source: &Path) -> Result<PathBuf, IngestError> {
        let Some(program) = &self.program else {
            return Err(IngestError::Convert {
                program: "none".to_string(),
                detail: "conversion is disabled".to_string(),
            });
        };
        let outdir = source
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let target = source.with_extension("xlsx");

        let mut command = Command::new(program);
        command
            .arg("--headless")
            .arg("--convert-to")
            .arg("xlsx")
            .arg("--outdir")
            .arg(outdir)
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(program = %program, file = %source.display(), "converting");

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| IngestError::Timeout {
                what: "conversion",
                after: self.timeout,
            })?
            .map_err(|err| IngestError::Convert {
                program: program.clone(),
                detail: err.to_string(),
            })?;

        if !output.status.success() {
            return Err(IngestError::Convert {
                program: program.clone(),
                detail: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        if !target.exists() {
            return Err(IngestError::Convert {
                program: program.clone(),
                detail: format!("expected output {} was not produced", target.display()),
            });
        }
        info!(from = %source.display(), to = %target.display(), "converted workbook");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_disables_conversion() {
        assert!(!Converter::new("none", Duration::from_secs(1)).is_enabled());
        assert!(!Converter::new("  ", Duration::from_secs(1)).is_enabled());
        assert!(Converter::new("soffice", Duration::from_secs(1)).is_enabled());
    }

    #[tokio::test]
    async fn disabled_converter_refuses_to_run() {
        let err = Converter::disabled()
            .convert(Path::new("report.xls"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Convert { .. }));
    }

    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.sync_all().unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_the_external_program_and_honours_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let fake = script(
            dir.path(),
            "fake-office.sh",
            "#!/bin/sh\nbase=$(basename \"$6\" .xls)\ncp \"$6\" \"$5/$base.xlsx\"\n",
        );
        let source = dir.path().join("snfnReport.xls");
        std::fs::write(&source, b"payload").unwrap();

        let converter = Converter::new(fake.to_str().unwrap(), Duration::from_secs(10));
        let target = converter.convert(&source).await.unwrap();
        assert_eq!(target, dir.path().join("snfnReport.xlsx"));
        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
        assert!(source.exists());

        let failing = script(dir.path(), "failing.sh", "#!/bin/sh\necho broken >&2\nexit 3\n");
        let err = Converter::new(failing.to_str().unwrap(), Duration::from_secs(10))
            .convert(&source)
            .await
            .unwrap_err();
        match err {
            IngestError::Convert { detail, .. } => assert!(detail.contains("broken")),
            other => panic!("unexpected error {other}"),
        }

        let slow = script(dir.path(), "slow.sh", "#!/bin/sh\nsleep 5\n");
        let err = Converter::new(slow.to_str().unwrap(), Duration::from_millis(200))
            .convert(&source)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Timeout { what: "conversion", .. }));
    }
}

//! External tool command lines
//!
//! Decompile and recompile go through apktool, signing through
//! uber-apk-signer; all three run as `java -jar <jar> ...`. Exit status 0
//! means success.

use std::path::{Path, PathBuf};

use crate::config::{Settings, SigningSettings};
use crate::runner::ToolCommand;

/// Label of the decompiler/recompiler in logs and failure messages
pub const APKTOOL: &str = "apktool";

/// Label of the signer in logs and failure messages
pub const SIGNER: &str = "uber-apk-signer";

/// Resolved tool locations
#[derive(Debug, Clone)]
pub struct Toolchain {
    java: PathBuf,
    apktool_jar: PathBuf,
    signer_jar: PathBuf,
    signing: SigningSettings,
    /// The repack stage already aligned the archive
    prealigned: bool,
}

impl Toolchain {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            java: settings.tools.java.clone(),
            apktool_jar: settings.tools.apktool_jar.clone(),
            signer_jar: settings.tools.signer_jar.clone(),
            signing: settings.signing.clone(),
            prealigned: settings.align.enabled,
        }
    }

    /// Jars that do not exist on disk
    pub fn missing_jars(&self) -> Vec<PathBuf> {
        [&self.apktool_jar, &self.signer_jar]
            .into_iter()
            .filter(|jar| !jar.is_file())
            .cloned()
            .collect()
    }

    fn jar(&self, label: &str, jar: &Path) -> ToolCommand {
        ToolCommand::new(label, &self.java).arg("-jar").arg(jar)
    }

    /// `apktool d -f <archive> -o <dest>`
    pub fn decompile(&self, archive: &Path, dest: &Path) -> ToolCommand {
        self.jar(APKTOOL, &self.apktool_jar)
            .args(["d", "-f"])
            .arg(archive)
            .arg("-o")
            .arg(dest)
    }

    /// `apktool b -f <source> -o <archive>`
    pub fn recompile(&self, source: &Path, archive: &Path) -> ToolCommand {
        self.jar(APKTOOL, &self.apktool_jar)
            .args(["b", "-f"])
            .arg(source)
            .arg("-o")
            .arg(archive)
    }

    /// `uber-apk-signer -a <archive> -o <out_dir>` plus keystore flags
    ///
    /// With alignment enabled the archive is already aligned and
    /// `--skipZipAlign` keeps the signer from redoing it. Otherwise the
    /// signer runs its bundled zipalign.
    pub fn sign(&self, archive: &Path, out_dir: &Path) -> ToolCommand {
        let mut cmd = self
            .jar(SIGNER, &self.signer_jar)
            .arg("-a")
            .arg(archive)
            .arg("-o")
            .arg(out_dir);
        if self.prealigned {
            cmd = cmd.arg("--skipZipAlign");
        }

        if let Some(keystore) = &self.signing.keystore {
            cmd = cmd.arg("--ks").arg(keystore);
            if let Some(alias) = &self.signing.alias {
                cmd = cmd.arg("--ksAlias").arg(alias);
            }
            if let Some(pass) = &self.signing.store_password {
                cmd = cmd.secret_arg("--ksPass", pass);
            }
            if let Some(pass) = &self.signing.key_password {
                cmd = cmd.secret_arg("--ksKeyPass", pass);
            }
        }
        cmd
    }

    /// File name suffix the signer gives its output
    ///
    /// `signing.output_suffix` when set, else the signer's own naming:
    /// `-aligned` when it zipaligned, then `-signed` or `-debugSigned`.
    pub fn signer_suffix(&self) -> String {
        if let Some(suffix) = &self.signing.output_suffix {
            return suffix.clone();
        }
        let aligned = if self.prealigned { "" } else { "-aligned" };
        let signed = if self.signing.keystore.is_some() {
            "-signed"
        } else {
            "-debugSigned"
        };
        format!("{}{}.apk", aligned, signed)
    }

    /// Find the signer's output for `base_name` in `out_dir`.
    ///
    /// Prefers `<base><suffix>`; otherwise the only `.apk` whose name starts
    /// with the base name.
    pub fn locate_signed(&self, out_dir: &Path, base_name: &str) -> Option<PathBuf> {
        let expected = out_dir.join(format!("{}{}", base_name, self.signer_suffix()));
        if expected.is_file() {
            return Some(expected);
        }
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(out_dir)
            .ok()?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension().and_then(|e| e.to_str()) == Some("apk")
                    && p
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(base_name))
            })
            .collect();
        if candidates.len() == 1 {
            candidates.pop()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn toolchain() -> Toolchain {
        Toolchain::from_settings(&Settings::with_root(Path::new("/r")))
    }

    #[test]
    fn test_decompile_command() {
        let cmd = toolchain().decompile(Path::new("/in/demo.apk"), Path::new("/w/demo/source"));
        assert_eq!(cmd.label, APKTOOL);
        assert_eq!(cmd.program, PathBuf::from("java"));
        assert_eq!(
            cmd.args_lossy(),
            vec![
                "-jar",
                "/r/tools/apktool.jar",
                "d",
                "-f",
                "/in/demo.apk",
                "-o",
                "/w/demo/source"
            ]
        );
    }

    #[test]
    fn test_recompile_command() {
        let cmd = toolchain().recompile(Path::new("/w/demo/source"), Path::new("/o/demo/demo.apk"));
        assert_eq!(
            cmd.args_lossy()[2..],
            ["b", "-f", "/w/demo/source", "-o", "/o/demo/demo.apk"]
        );
    }

    #[test]
    fn test_sign_debug_key() {
        let cmd = toolchain().sign(Path::new("/o/demo/demo.apk"), Path::new("/o/demo/fixed"));
        assert_eq!(cmd.label, SIGNER);
        assert_eq!(
            cmd.args_lossy(),
            vec![
                "-jar",
                "/r/tools/uber-apk-signer.jar",
                "-a",
                "/o/demo/demo.apk",
                "-o",
                "/o/demo/fixed",
                "--skipZipAlign"
            ]
        );
    }

    #[test]
    fn test_sign_realigns_when_alignment_disabled() {
        let mut settings = Settings::with_root(Path::new("/r"));
        settings.align.enabled = false;
        let toolchain = Toolchain::from_settings(&settings);
        let cmd = toolchain.sign(Path::new("/o/demo/demo.apk"), Path::new("/o/demo/fixed"));
        assert!(!cmd.args_lossy().contains(&"--skipZipAlign".to_string()));
        assert_eq!(toolchain.signer_suffix(), "-aligned-debugSigned.apk");
    }

    #[test]
    fn test_signer_suffix() {
        assert_eq!(toolchain().signer_suffix(), "-debugSigned.apk");

        let mut settings = Settings::with_root(Path::new("/r"));
        settings.signing.keystore = Some(PathBuf::from("/keys/release.jks"));
        assert_eq!(
            Toolchain::from_settings(&settings).signer_suffix(),
            "-signed.apk"
        );

        settings.signing.output_suffix = Some("-custom.apk".to_string());
        assert_eq!(
            Toolchain::from_settings(&settings).signer_suffix(),
            "-custom.apk"
        );
    }

    #[test]
    fn test_sign_with_keystore_masks_passwords() {
        let mut settings = Settings::with_root(Path::new("/r"));
        settings.signing.keystore = Some(PathBuf::from("/keys/release.jks"));
        settings.signing.alias = Some("release".to_string());
        settings.signing.store_password = Some("storepw".to_string());
        settings.signing.key_password = Some("keypw".to_string());

        let cmd = Toolchain::from_settings(&settings)
            .sign(Path::new("/o/demo/demo.apk"), Path::new("/o/demo/fixed"));
        let args = cmd.args_lossy();
        assert!(args.windows(2).any(|w| w == ["--ks", "/keys/release.jks"]));
        assert!(args.windows(2).any(|w| w == ["--ksAlias", "release"]));
        assert!(args.windows(2).any(|w| w == ["--ksPass", "storepw"]));
        assert!(args.windows(2).any(|w| w == ["--ksKeyPass", "keypw"]));

        let shown = cmd.display();
        assert!(!shown.contains("storepw"));
        assert!(!shown.contains("keypw"));
        assert!(shown.contains("--ksAlias release"));
    }

    #[test]
    fn test_locate_signed_prefers_suffix() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("demo-debugSigned.apk"), b"x").unwrap();
        std::fs::write(dir.path().join("demo-other.apk"), b"x").unwrap();
        assert_eq!(
            toolchain().locate_signed(dir.path(), "demo"),
            Some(dir.path().join("demo-debugSigned.apk"))
        );
    }

    #[test]
    fn test_locate_signed_fallback() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("demo-signed.apk"), b"x").unwrap();
        std::fs::write(dir.path().join("demo.idsig"), b"x").unwrap();
        assert_eq!(
            toolchain().locate_signed(dir.path(), "demo"),
            Some(dir.path().join("demo-signed.apk"))
        );

        std::fs::write(dir.path().join("demo-second.apk"), b"x").unwrap();
        assert_eq!(toolchain().locate_signed(dir.path(), "demo"), None);
    }

    #[test]
    fn test_missing_jars() {
        assert_eq!(toolchain().missing_jars().len(), 2);
    }
}

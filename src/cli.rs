use std::path::{Path, PathBuf};

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "kubefs",
    version,
    about = "Mount Kubernetes resources as a filesystem"
)]
pub struct Cli {
    /// Path to the config document; relative paths resolve against the CWD
    #[arg(long, default_value = "kubefs.yaml")]
    pub config: PathBuf,

    /// Directory to mount the filesystem on
    pub mountpoint: PathBuf,
}

/// Resolve the config path against the current directory when relative.
pub fn resolve_config_path(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mountpoint_is_required() {
        assert!(Cli::try_parse_from(["kubefs"]).is_err());
        let cli = Cli::try_parse_from(["kubefs", "/mnt/kube"]).unwrap();
        assert_eq!(cli.mountpoint, PathBuf::from("/mnt/kube"));
        assert_eq!(cli.config, PathBuf::from("kubefs.yaml"));
    }

    #[test]
    fn extra_positionals_are_rejected() {
        assert!(Cli::try_parse_from(["kubefs", "/mnt/a", "/mnt/b"]).is_err());
    }

    #[test]
    fn config_flag_overrides_default() {
        let cli = Cli::try_parse_from(["kubefs", "--config", "/etc/kubefs.yaml", "/mnt/kube"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/kubefs.yaml"));
    }

    #[test]
    fn absolute_config_paths_stay_put() {
        let resolved = resolve_config_path(Path::new("/etc/kubefs.yaml")).unwrap();
        assert_eq!(resolved, PathBuf::from("/etc/kubefs.yaml"));
    }

    #[test]
    fn relative_config_paths_resolve_against_cwd() {
        let resolved = resolve_config_path(Path::new("kubefs.yaml")).unwrap();
        assert_eq!(resolved, std::env::current_dir().unwrap().join("kubefs.yaml"));
    }
}

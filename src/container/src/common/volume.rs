/// Action volume parsing
use std::path::PathBuf;
use workflow::Volume;

/// Bind mount derived from an action volume string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    /// Source path on host
    pub source: PathBuf,

    /// Destination path in container
    pub destination: PathBuf,

    /// Mount options
    pub options: Vec<String>,
}

impl VolumeMount {
    /// Parse `src:dst[:opt,opt]`. Returns `None` for strings missing a source or destination.
    ///
    /// Options always include `rbind` plus `ro` or `rw` (default `rw`).
    pub fn parse(volume: &Volume) -> Option<Self> {
        let mut parts = volume.as_str().splitn(3, ':');
        let source = parts.next().filter(|s| !s.is_empty())?;
        let destination = parts.next().filter(|s| !s.is_empty())?;

        let mut options = vec!["rbind".to_string()];
        let mut mode = "rw";
        if let Some(opts) = parts.next() {
            for opt in opts.split(',').filter(|o| !o.is_empty()) {
                match opt {
                    "ro" | "rw" => mode = opt,
                    other => options.push(other.to_string()),
                }
            }
        }
        options.push(mode.to_string());

        Some(Self {
            source: PathBuf::from(source),
            destination: PathBuf::from(destination),
            options,
        })
    }
}

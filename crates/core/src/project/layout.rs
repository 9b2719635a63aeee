//! Directory convention shared with stage collaborators:
//! `<workingDir>/<project>/<plugin>/<stage>/<year>/<dayOfYear>/`.

use std::io;
use std::path::{Path, PathBuf};

use crate::cache::DateKey;
use crate::stage::PipelineStageKind;

#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(working_dir: &Path, project: &str) -> Self {
        Self {
            root: working_dir.join(project),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plugin_dir(&self, plugin: &str) -> PathBuf {
        self.root.join(plugin)
    }

    pub fn stage_dir(&self, plugin: &str, stage: PipelineStageKind) -> PathBuf {
        self.plugin_dir(plugin).join(stage.as_str())
    }

    pub fn unit_dir(&self, plugin: &str, stage: PipelineStageKind, date: DateKey) -> PathBuf {
        date_dir(&self.stage_dir(plugin, stage), date)
    }

    /// Create the stage directories for one plugin.
    pub fn provision(&self, plugin: &str) -> io::Result<()> {
        for stage in PipelineStageKind::ALL {
            std::fs::create_dir_all(self.stage_dir(plugin, stage))?;
        }
        Ok(())
    }
}

/// `<base>/<year>/<dayOfYear>` with a zero-padded day.
pub(crate) fn date_dir(base: &Path, date: DateKey) -> PathBuf {
    base.join(date.year.to_string())
        .join(format!("{:03}", date.day_of_year))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unit_dir_layout() {
        let layout = ProjectLayout::new(Path::new("/work"), "amhara");
        let dir = layout.unit_dir("modis_lst", PipelineStageKind::Index, DateKey::new(2024, 7));
        assert_eq!(dir, PathBuf::from("/work/amhara/modis_lst/indices/2024/007"));
    }

    #[test]
    fn test_provision_creates_stage_dirs() {
        let tmp = TempDir::new().unwrap();
        let layout = ProjectLayout::new(tmp.path(), "p");
        layout.provision("plug").unwrap();
        for stage in PipelineStageKind::ALL {
            assert!(layout.stage_dir("plug", stage).is_dir());
        }
    }
}

// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use manman_common::domain::{RenderedConfiguration, StrategyType};

use crate::RenderError;
use crate::properties::{merge_properties, parse_properties, render_properties};

/// Where one session's rendered files live on the host.
pub fn session_data_dir(
    host_data_dir: &Path,
    environment: &str,
    sgc_id: i64,
    session_id: i64,
) -> PathBuf {
    host_data_dir.join(format!("sgc-{environment}-{sgc_id}/session-{session_id}"))
}

/// Render every strategy for a session into `base_data_dir`.
///
/// A strategy type we don't implement yet is logged and skipped, never
/// failed: the session may well run fine without it. An error rendering an
/// implemented strategy fails the whole call (and with it the session start).
pub fn write_rendered_files(
    records: &[RenderedConfiguration],
    base_data_dir: &Path,
) -> Result<(), RenderError> {
    for record in records {
        match record.strategy_type {
            StrategyType::FileProperties => {
                let host_path = target_host_path(base_data_dir, &record.target_path);
                let content = render_file_properties(record, &host_path)?;
                write_file(&host_path, content.as_bytes())?;
                debug!(strategy = %record.strategy_name, path = %host_path.display(), "rendered");
            }
            other => {
                warn!(
                    strategy = %record.strategy_name,
                    strategy_type = %other,
                    "strategy type not implemented yet, skipping"
                );
            }
        }
    }
    Ok(())
}

fn target_host_path(base_data_dir: &Path, target_path: &str) -> PathBuf {
    base_data_dir.join(target_path.trim_start_matches('/'))
}

/// The two modes: a non-empty base template replaces whatever is on disk;
/// an empty one merges over the existing file (if any).
fn render_file_properties(
    record: &RenderedConfiguration,
    host_path: &Path,
) -> Result<String, RenderError> {
    let base = if !record.base_content.is_empty() {
        parse_properties(&record.base_content)
    } else if host_path.exists() {
        let existing = fs::read_to_string(host_path).map_err(|e| RenderError::ReadExisting {
            path: host_path.display().to_string(),
            source: e,
        })?;
        parse_properties(&existing)
    } else {
        Default::default()
    };

    let overrides = parse_properties(&record.rendered_content);
    Ok(render_properties(&merge_properties(base, overrides)))
}

/// Parents 0755, file 0644, written to a sibling temp path and renamed so a
/// crash mid-write never leaves a truncated file behind.
fn write_file(path: &Path, content: &[u8]) -> Result<(), RenderError> {
    let write_err = |e: std::io::Error| RenderError::Write {
        path: path.display().to_string(),
        source: e,
    };

    if let Some(parent) = path.parent() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(parent)
            .map_err(write_err)?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).map_err(write_err)?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644)).map_err(write_err)?;
    fs::rename(&tmp, path).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn properties_record(base: &str, rendered: &str) -> RenderedConfiguration {
        RenderedConfiguration {
            strategy_name: "server-properties".to_string(),
            strategy_type: StrategyType::FileProperties,
            target_path: "/data/server.properties".to_string(),
            base_content: base.to_string(),
            rendered_content: rendered.to_string(),
        }
    }

    #[test]
    fn session_dir_layout() {
        assert_eq!(
            session_data_dir(Path::new("/srv/manman"), "prod", 3, 7),
            PathBuf::from("/srv/manman/sgc-prod-3/session-7")
        );
    }

    #[test]
    fn renders_base_template_with_overrides() {
        let dir = TempDir::new().unwrap();
        let record = properties_record("motd=Default\nmax-players=20", "motd=Patched");
        write_rendered_files(std::slice::from_ref(&record), dir.path()).unwrap();

        let written =
            fs::read_to_string(dir.path().join("data/server.properties")).unwrap();
        assert_eq!(written, "max-players=20\nmotd=Patched\n");
    }

    #[test]
    fn merge_mode_preserves_existing_keys() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("data/server.properties");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(
            &target,
            "motd=Default\nmax-players=20\ndifficulty=normal\npvp=true\n",
        )
        .unwrap();

        // Empty base selects merge mode against the on-disk file.
        let record = properties_record("", "motd=Patched\nmax-players=50");
        write_rendered_files(std::slice::from_ref(&record), dir.path()).unwrap();

        let written = fs::read_to_string(&target).unwrap();
        assert_eq!(
            parse_properties(&written),
            parse_properties("motd=Patched\nmax-players=50\ndifficulty=normal\npvp=true")
        );
    }

    #[test]
    fn merge_mode_with_no_existing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let record = properties_record("", "motd=Only\n");
        write_rendered_files(std::slice::from_ref(&record), dir.path()).unwrap();
        let written =
            fs::read_to_string(dir.path().join("data/server.properties")).unwrap();
        assert_eq!(written, "motd=Only\n");
    }

    #[test]
    fn unimplemented_strategy_is_skipped_not_failed() {
        let dir = TempDir::new().unwrap();
        let record = RenderedConfiguration {
            strategy_name: "startup-args".to_string(),
            strategy_type: StrategyType::CliArgs,
            target_path: "/data/args".to_string(),
            base_content: String::new(),
            rendered_content: "--nogui".to_string(),
        };
        write_rendered_files(&[record], dir.path()).unwrap();
        assert!(!dir.path().join("data/args").exists());
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let record = properties_record("a=1", "b=2");
        write_rendered_files(std::slice::from_ref(&record), dir.path()).unwrap();
        assert!(!dir.path().join("data/server.tmp").exists());
        assert!(dir.path().join("data/server.properties").exists());
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::editor;
use crate::error::{CalibError, IoContext, Result};
use crate::fsutil::{copy_tree_filtered, dir_has_entries, ensure_dir, remove_tree};
use crate::layout::SimulationLayout;

#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub namelist_dir: PathBuf,
    /// Output sink the simulation writes into.
    pub output_dir: PathBuf,
    pub ancillary: Option<PathBuf>,
}

impl Workspace {
    pub fn config_file(&self, name: &str) -> PathBuf {
        self.namelist_dir.join(name)
    }
}

/// Copies the master configuration tree into `workspace_dir/namelist` and
/// creates the `output` sink next to it.
pub fn stage(
    master_dir: &Path,
    workspace_dir: &Path,
    overwrite: bool,
    layout: &SimulationLayout,
) -> Result<Workspace> {
    if dir_has_entries(workspace_dir)? {
        if !overwrite {
            return Err(CalibError::WorkspaceNotEmpty {
                path: workspace_dir.to_path_buf(),
            });
        }
        info!(workspace = %workspace_dir.display(), "clearing existing workspace");
        remove_tree(workspace_dir)?;
    }
    ensure_dir(workspace_dir)?;
    let root = fs::canonicalize(workspace_dir).at(workspace_dir)?;
    let namelist_dir = root.join("namelist");
    let output_dir = root.join("output");
    ensure_dir(&namelist_dir)?;
    ensure_dir(&output_dir)?;

    let copied = copy_tree_filtered(master_dir, &namelist_dir, &layout.config_extensions)?;
    if copied.is_empty() {
        remove_tree(&root)?;
        return Err(CalibError::InvalidPlan(format!(
            "no configuration files ({}) found in {}",
            layout.config_extensions.join(", "),
            master_dir.display()
        )));
    }
    info!(
        workspace = %root.display(),
        files = copied.len(),
        "staged configuration"
    );
    Ok(Workspace {
        root,
        namelist_dir,
        output_dir,
        ancillary: None,
    })
}

/// Copies the soil ancillary file into the workspace root and points the
/// companion namelist at the copy.
pub fn stage_ancillary(
    workspace: &mut Workspace,
    source: &Path,
    layout: &SimulationLayout,
) -> Result<PathBuf> {
    let name = source.file_name().ok_or_else(|| {
        CalibError::InvalidPlan(format!("soil ancillary has no file name: {}", source.display()))
    })?;
    let target = workspace.root.join(name);
    fs::copy(source, &target).at(source)?;
    let companion = workspace.config_file(&layout.soil.companion_file);
    let target_str = target.to_string_lossy();
    if !editor::set_string_field(
        &companion,
        &layout.soil.block,
        &layout.soil.file_field,
        &target_str,
    )? {
        return Err(CalibError::RequiredEditFailed {
            file: layout.soil.companion_file.clone(),
            block: layout.soil.block.clone(),
            field: layout.soil.file_field.clone(),
        });
    }
    workspace.ancillary = Some(target.clone());
    Ok(target)
}

/// Points the simulation's output directory field at `sink`.
pub fn redirect_output(workspace: &Workspace, sink: &Path, layout: &SimulationLayout) -> Result<()> {
    let target = format!("{}/", sink.to_string_lossy().trim_end_matches('/'));
    let file = workspace.config_file(&layout.output_file);
    if !editor::set_string_field(&file, &layout.output_block, &layout.output_dir_field, &target)? {
        return Err(CalibError::RequiredEditFailed {
            file: layout.output_file.clone(),
            block: layout.output_block.clone(),
            field: layout.output_dir_field.clone(),
        });
    }
    Ok(())
}

pub fn teardown(workspace: &Workspace) -> Result<()> {
    remove_tree(&workspace.root)?;
    info!(workspace = %workspace.root.display(), "workspace removed");
    Ok(())
}

/// Owns a staged workspace and removes it when dropped, unless
/// [`WorkspaceGuard::teardown`] already did.
pub struct WorkspaceGuard {
    workspace: Workspace,
    done: bool,
}

impl WorkspaceGuard {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            done: false,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn workspace_mut(&mut self) -> &mut Workspace {
        &mut self.workspace
    }

    pub fn teardown(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        teardown(&self.workspace)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = teardown(&self.workspace) {
                warn!(workspace = %self.workspace.root.display(), "workspace teardown failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namelist::read_field_from_file;
    use chrono::Utc;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "calib_ws_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    fn master(root: &Path) -> PathBuf {
        let master = root.join("master");
        ensure_dir(&master).expect("master");
        fs::write(
            master.join("output.nml"),
            "&jules_output\noutput_dir='./output',\nrun_id='',\n/\n",
        )
        .expect("output.nml");
        fs::write(master.join("README"), "not copied").expect("readme");
        master
    }

    #[test]
    fn stage_copies_config_and_refuses_non_empty_target() {
        let root = scratch("stage");
        let master = master(&root);
        let ws_dir = root.join("tmp");
        let layout = SimulationLayout::default();

        let ws = stage(&master, &ws_dir, false, &layout).expect("stage");
        assert!(ws.namelist_dir.join("output.nml").exists());
        assert!(!ws.namelist_dir.join("README").exists());
        assert!(ws.output_dir.is_dir());

        let err = stage(&master, &ws_dir, false, &layout).expect_err("non-empty");
        assert_eq!(err.code(), "workspace_not_empty");
        stage(&master, &ws_dir, true, &layout).expect("overwrite");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn redirect_output_writes_quoted_sink() {
        let root = scratch("redirect");
        let master = master(&root);
        let layout = SimulationLayout::default();
        let ws = stage(&master, &root.join("tmp"), false, &layout).expect("stage");
        redirect_output(&ws, &ws.output_dir, &layout).expect("redirect");
        let value = read_field_from_file(&ws.config_file("output.nml"), "jules_output", "output_dir")
            .expect("read");
        assert_eq!(value, format!("'{}/'", ws.output_dir.display()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn guard_tears_down_on_drop() {
        let root = scratch("guard");
        let master = master(&root);
        let ws = stage(&master, &root.join("tmp"), false, &SimulationLayout::default())
            .expect("stage");
        let staged_root = ws.root.clone();
        {
            let _guard = WorkspaceGuard::new(ws);
        }
        assert!(!staged_root.exists());
        let _ = fs::remove_dir_all(root);
    }
}

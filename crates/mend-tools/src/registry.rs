//! Assembles the agent's tool set.

use std::sync::Arc;

use mend_core::config::Timeouts;
use mend_llm::Tool;

use crate::guard::PermissionCallback;
use crate::install::Installer;
use crate::keyword::keyword_tool;
use crate::patch::{patch_tool, str_replace_tool};
use crate::shell::ShellTool;
use crate::think::think_tool;

/// Selects the single-replacement editor tool instead of patch.
pub const NATIVE_EDIT_ENV: &str = "MEND_NATIVE_EDIT";

/// Options for building the standard tool set.
#[derive(Default)]
pub struct RegistryOptions {
    pub check_permission: Option<PermissionCallback>,
    pub timeouts: Option<Timeouts>,
    /// Enables just-in-time installation of missing binaries.
    pub enable_jit_install: bool,
}

/// The base tools available to the root conversation. The codereview and
/// done tools are appended by the agent, which owns the reviewer they
/// share.
pub fn base_tools(opts: RegistryOptions) -> (Vec<Tool>, Arc<Installer>) {
    let installer = Arc::new(Installer::new());
    let shell = ShellTool {
        check_permission: opts.check_permission,
        installer: opts.enable_jit_install.then(|| installer.clone()),
        timeouts: opts.timeouts.unwrap_or_default(),
    };
    let edit = if std::env::var_os(NATIVE_EDIT_ENV).is_some() {
        str_replace_tool()
    } else {
        patch_tool()
    };
    let tools = vec![shell.tool(), edit, think_tool(), keyword_tool()];
    (tools, installer)
}

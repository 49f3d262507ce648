//! Bootstrap scripts for generated containers
//!
//! The script writes the agent config and auth secret files into the work
//! directory, locks down their permissions and then starts the agent. Secret
//! values only ever appear inside quoted heredocs (POSIX) or literal
//! here-strings (PowerShell) so they are never expanded, traced or passed on
//! a child process command line.

use std::sync::LazyLock;
use std::time::Duration;

use minijinja::{context, Environment, UndefinedBehavior};
use serde::Serialize;

use crate::platform::Platform;
use crate::{Error, Result};

/// Terminator of the quoted heredocs in POSIX scripts
pub const HEREDOC_DELIMITER: &str = "INFISICAL_AGENT_EOF";

/// Terminator prefix of PowerShell literal here-strings
const HERE_STRING_TERMINATOR: &str = "'@";

static TEMPLATES: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_filter("sh_quote", sh_quote);
    env.add_filter("ps_quote", ps_quote);
    env.add_template("posix.sh.j2", include_str!("templates/posix.sh.j2"))
        .expect("posix bootstrap template is embedded and valid");
    env.add_template("powershell.ps1.j2", include_str!("templates/powershell.ps1.j2"))
        .expect("powershell bootstrap template is embedded and valid");
    env
});

/// Inputs for one container's bootstrap script
#[derive(Clone, Debug)]
pub struct BootstrapScript<'a> {
    /// Target platform
    pub platform: Platform,
    /// Directory the config and secret files are written to
    pub config_dir: &'a str,
    /// Serialized agent configuration
    pub config_yaml: &'a str,
    /// Secret file name and content pairs
    pub secret_files: &'a [(&'static str, &'a str)],
    /// Wall-clock limit for the agent run; `None` runs it for the container's lifetime
    pub timeout: Option<Duration>,
}

#[derive(Serialize)]
struct FileEntry<'a> {
    path: String,
    content: &'a str,
}

impl BootstrapScript<'_> {
    /// Render the script for this platform.
    ///
    /// Fails when any written content contains a line that would terminate
    /// its heredoc early.
    pub fn render(&self, config_file: &str) -> Result<String> {
        let config_yaml = self.config_yaml.trim_end_matches('\n');
        self.check_content("agent config", config_yaml)?;

        let mut files = Vec::with_capacity(self.secret_files.len());
        for &(name, content) in self.secret_files {
            self.check_content(name, content)?;
            files.push(FileEntry {
                path: self.platform.join(self.config_dir, name),
                content,
            });
        }

        let template = TEMPLATES
            .get_template(self.platform.script_template())
            .map_err(|e| Error::script(e.to_string()))?;

        template
            .render(context! {
                config_dir => self.config_dir,
                config_file => config_file,
                config_yaml => config_yaml,
                delimiter => HEREDOC_DELIMITER,
                files => files,
                timeout_secs => self.timeout.map(|t| t.as_secs()),
            })
            .map_err(|e| Error::script(format!("failed to render bootstrap script: {e}")))
    }

    fn check_content(&self, what: &str, content: &str) -> Result<()> {
        let terminates = |line: &str| match self.platform {
            Platform::Linux => line == HEREDOC_DELIMITER,
            Platform::Windows => line.trim_start().starts_with(HERE_STRING_TERMINATOR),
        };

        if content.lines().any(terminates) {
            return Err(Error::script(format!(
                "{what} contains a line that would end its heredoc"
            )));
        }
        Ok(())
    }
}

/// Quote a value as a single POSIX shell word
fn sh_quote(value: String) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote a value as a literal PowerShell string
fn ps_quote(value: String) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

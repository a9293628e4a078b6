//! `completions` command: print or install shell completion scripts.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use crate::{Cli, CliError};

const BIN: &str = "hwauth";

fn render(shell: Shell, out: &mut dyn io::Write) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, BIN, out);
}

/// Print completions for `shell` to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    render(shell, &mut io::stdout());
}

/// Where the completion script for `shell` is picked up automatically.
fn install_path(shell: Shell, dirs: &BaseDirs) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => dirs
            .data_dir()
            .join("bash-completion/completions")
            .join(BIN),
        Shell::Zsh => dirs.home_dir().join(".zfunc").join(format!("_{BIN}")),
        Shell::Fish => dirs
            .config_dir()
            .join("fish/completions")
            .join(format!("{BIN}.fish")),
        Shell::Elvish => dirs
            .config_dir()
            .join("elvish/lib")
            .join(format!("{BIN}.elv")),
        Shell::PowerShell => dirs
            .config_dir()
            .join("powershell/completions")
            .join(format!("{BIN}.ps1")),
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(path)
}

/// Make sure `~/.zfunc` is on the zsh `fpath`.
fn ensure_zsh_fpath(home: &Path) -> Result<()> {
    const FPATH_LINE: &str = "fpath=(~/.zfunc $fpath)";
    let zshrc = home.join(".zshrc");
    if fs::read_to_string(&zshrc).is_ok_and(|content| content.contains(FPATH_LINE)) {
        return Ok(());
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&zshrc)
        .with_context(|| format!("Failed to update {}", zshrc.display()))?;
    writeln!(file, "\n# {BIN} completions")?;
    writeln!(file, "{FPATH_LINE}")?;
    writeln!(file, "autoload -Uz compinit && compinit")?;
    eprintln!(
        "{} Added fpath to {}",
        style("✓").green().bold(),
        style(zshrc.display()).yellow()
    );
    Ok(())
}

fn activation_hint(shell: Shell, path: &Path) -> String {
    match shell {
        Shell::Bash => format!(
            "Completions load on new terminals. To activate now: {}",
            style(format!("source {}", path.display())).cyan()
        ),
        Shell::Zsh => format!("Restart your shell or run: {}", style("exec zsh").cyan()),
        Shell::PowerShell => format!(
            "Add this to your PowerShell profile: {}",
            style(format!(". {}", path.display())).cyan()
        ),
        _ => "Completions load automatically in new sessions.".to_string(),
    }
}

/// Install completions for `shell`, or for the shell running us.
pub(crate) fn cmd_completions_install(shell: Option<Shell>) -> Result<()> {
    let shell = shell.or_else(Shell::from_env).ok_or_else(|| {
        CliError::Usage(format!(
            "could not detect your shell; run e.g. `{BIN} completions --install bash`"
        ))
    })?;
    let dirs = BaseDirs::new().context("Could not determine home directory")?;
    let path = install_path(shell, &dirs)?;

    let mut script = Vec::new();
    render(shell, &mut script);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &script)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {shell} completions to {}",
        style("✓").green().bold(),
        style(path.display()).yellow()
    );
    if shell == Shell::Zsh {
        ensure_zsh_fpath(dirs.home_dir())?;
    }
    eprintln!("\n{}", activation_hint(shell, &path));
    Ok(())
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `eidetic config` - inspect, check and scaffold mount manifests

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::fmt;
use std::path::{Path, PathBuf};

use eidetic_core::domain::mount_config::{MountConfigManifest, MountSpec};

const MINIMAL_TEMPLATE: &str = include_str!("../../templates/eidetic-minimal.yaml");
const FULL_TEMPLATE: &str = include_str!("../../templates/eidetic-with-examples.yaml");
const TEMPLATE_SOURCE_LINE: &str = "  source: ./documents";

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the settings a mount would run with
    Show {
        /// Dump the full manifest as YAML instead of the summary
        #[arg(long)]
        yaml: bool,
    },

    /// Check a manifest and the environment it would mount in
    Validate {
        /// Manifest to check (default: the one `mount` would use)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Write a starter manifest
    Generate {
        #[arg(short, long, default_value = "./eidetic.yaml")]
        output: PathBuf,

        /// Directory to overlay
        #[arg(long, value_name = "DIR")]
        source: Option<PathBuf>,

        /// Spell out every setting with comments
        #[arg(long)]
        examples: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { yaml } => show(config_override, yaml),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate {
            output,
            source,
            examples,
            force,
        } => generate(&output, source.as_deref(), examples, force),
    }
}

/// Where the effective manifest came from.
enum Origin {
    Flag(PathBuf),
    Discovered(PathBuf),
    Defaults,
}

impl Origin {
    fn resolve(config_override: Option<PathBuf>) -> Self {
        match config_override {
            Some(path) => Origin::Flag(path),
            None => MountConfigManifest::discover_config().map_or(Origin::Defaults, Origin::Discovered),
        }
    }

    fn path(&self) -> Option<PathBuf> {
        match self {
            Origin::Flag(path) | Origin::Discovered(path) => Some(path.clone()),
            Origin::Defaults => None,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Flag(path) => write!(f, "{} (--config)", path.display()),
            Origin::Discovered(path) => write!(f, "{}", path.display()),
            Origin::Defaults => write!(f, "built-in defaults"),
        }
    }
}

fn load(config_override: Option<PathBuf>) -> Result<(MountConfigManifest, Origin)> {
    let origin = Origin::resolve(config_override);
    let manifest = MountConfigManifest::load_or_default(origin.path())
        .with_context(|| format!("Failed to load configuration from {}", origin))?;
    Ok((manifest, origin))
}

fn show(config_override: Option<PathBuf>, as_yaml: bool) -> Result<()> {
    let (manifest, origin) = load(config_override)?;

    if as_yaml {
        print!("{}", serde_yaml::to_string(&manifest).context("Failed to render configuration")?);
        return Ok(());
    }

    println!("{} {}", "Mount".bold(), manifest.metadata.name.bold());
    println!("  Loaded from: {}", origin);
    if matches!(origin, Origin::Defaults) {
        for candidate in MountConfigManifest::config_candidates() {
            println!("    {} {}", "not found:".dimmed(), candidate.display());
        }
    }
    let overrides: Vec<String> = MountConfigManifest::ENV_OVERRIDES
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|value| format!("{}={}", name, value)))
        .collect();
    if !overrides.is_empty() {
        println!("  Environment overrides: {}", overrides.join(", "));
    }
    println!();

    print_spec(&manifest.spec);
    Ok(())
}

fn print_spec(spec: &MountSpec) {
    let source = if spec.source.is_dir() {
        spec.source.display().to_string().normal()
    } else {
        format!("{} (missing)", spec.source.display()).red()
    };
    println!("{}", "Source".bold());
    println!("  Directory: {}", source);
    println!(
        "  Mirror writes: {}   Durable commits: {}   Write settle: {:?}",
        yes_no(spec.mirror_writes),
        yes_no(spec.durable_commits),
        spec.write_settle
    );

    println!("{}", "NFS".bold());
    println!("  Listen: {}:{}", spec.nfs.bind_address, spec.nfs.port);
    println!("  Owner: {}:{}", spec.nfs.uid, spec.nfs.gid);

    println!("{}", "Vault".bold());
    let state = if env_is_set(&spec.vault.secret_env) {
        "unlocks at mount".green()
    } else {
        "stays locked".yellow()
    };
    println!("  {} (${} {})", spec.vault.root, spec.vault.secret_env, state);

    println!("{}", "Analysis".bold());
    println!(
        "  {} workers, queue {}, {} retries, timeout {:?}",
        spec.analysis.workers, spec.analysis.queue_capacity, spec.analysis.max_retries, spec.analysis.job_timeout
    );
    let kinds: Vec<String> = spec.analysis.kinds.iter().map(ToString::to_string).collect();
    println!("  Jobs: {}", kinds.join(", "));
    for rule in &spec.analysis.auto_organize {
        println!("  Organize: #{} → {}/", rule.tag, rule.folder);
    }

    println!("{}", "Views".bold());
    for rule in &spec.views.conversions {
        println!("  Convert: .{} → .{}", rule.from, rule.to);
    }
    println!(
        "  Web fetch timeout {:?}, cache {} entries for {:?}",
        spec.views.web_fetch_timeout, spec.views.cache_entries, spec.views.cache_ttl
    );
    println!("  API feeds: {}", spec.views.api_feeds.len());

    println!("{}", "License".bold());
    match &spec.license.endpoint {
        Some(endpoint) => println!("  Verified at {} (key from ${})", endpoint, spec.license.key_env),
        None => println!("  {}", "No endpoint, free mode".dimmed()),
    }
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    let (manifest, origin) = load(config_path)?;
    println!("Checking {}...", origin);

    manifest.validate().context("Configuration validation failed")?;
    println!("{}", "✓ Manifest is valid".green());

    let warnings = preflight(&manifest.spec);
    for warning in &warnings {
        println!("{} {}", "!".yellow(), warning);
    }
    if warnings.is_empty() {
        println!("{}", "✓ Ready to mount".green());
    }
    Ok(())
}

/// Problems that would not stop a mount from starting but change what it
/// can do.
fn preflight(spec: &MountSpec) -> Vec<String> {
    let mut warnings = Vec::new();
    if !spec.source.is_dir() {
        warnings.push(format!("Source {} is not a directory", spec.source.display()));
    }
    if !env_is_set(&spec.vault.secret_env) {
        warnings.push(format!(
            "${} is not set; files under {} will be unreadable",
            spec.vault.secret_env, spec.vault.root
        ));
    }
    if spec.license.endpoint.is_some() && !env_is_set(&spec.license.key_env) {
        warnings.push(format!(
            "License endpoint configured but ${} is not set; running in free mode",
            spec.license.key_env
        ));
    }
    warnings
}

fn generate(output: &Path, source: Option<&Path>, with_examples: bool, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to replace it)", output.display());
    }

    let manifest = render_template(with_examples, source);
    std::fs::write(output, manifest).with_context(|| format!("Failed to write {}", output.display()))?;

    println!("{} {}", "✓ Wrote".green(), output.display());
    println!("  Next: eidetic --config {} mount", output.display());
    Ok(())
}

fn render_template(with_examples: bool, source: Option<&Path>) -> String {
    let template = if with_examples { FULL_TEMPLATE } else { MINIMAL_TEMPLATE };
    match source {
        Some(source) => template.replacen(
            TEMPLATE_SOURCE_LINE,
            &format!("  source: {}", source.display()),
            1,
        ),
        None => template.to_string(),
    }
}

fn env_is_set(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| !value.trim().is_empty())
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_are_valid_manifests() {
        for template in [MINIMAL_TEMPLATE, FULL_TEMPLATE] {
            assert!(template.contains(TEMPLATE_SOURCE_LINE));
            let manifest = MountConfigManifest::from_yaml_str(template).unwrap();
            manifest.validate().unwrap();
        }
    }

    #[test]
    fn test_rendered_template_points_at_source() {
        let rendered = render_template(true, Some(Path::new("/srv/notes")));
        let manifest = MountConfigManifest::from_yaml_str(&rendered).unwrap();
        assert_eq!(manifest.spec.source, PathBuf::from("/srv/notes"));
    }

    #[test]
    fn test_generate_keeps_existing_file_without_force() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = dir.path().join("eidetic.yaml");

        generate(&output, Some(dir.path()), false, false).unwrap();
        let written = MountConfigManifest::from_yaml_file(&output).unwrap();
        assert_eq!(written.spec.source, dir.path());

        assert!(generate(&output, None, false, false).is_err());
        generate(&output, None, false, true).unwrap();
        let replaced = MountConfigManifest::from_yaml_file(&output).unwrap();
        assert_eq!(replaced.spec.source, PathBuf::from("./documents"));
    }

    #[test]
    fn test_preflight_flags_missing_source() {
        let mut spec = MountSpec::for_source("/definitely/not/here");
        spec.vault.secret_env = "EIDETIC_TEST_UNSET_SECRET".to_string();
        let warnings = preflight(&spec);
        assert!(warnings.iter().any(|w| w.contains("/definitely/not/here")));
        assert!(warnings.iter().any(|w| w.contains("$EIDETIC_TEST_UNSET_SECRET")));
    }
}

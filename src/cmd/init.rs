//! Project initialization command (`repowatch init`).

use anyhow::{Context, Result};
use std::path::Path;

use repowatch::config::{CONFIG_DIR, RepowatchConfig, RepowatchToml};

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    let config_dir = project_dir.join(CONFIG_DIR);
    let was_initialized = config_dir.exists();
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;

    let config_path = config_dir.join(repowatch::config::CONFIG_FILE);
    if !config_path.exists() {
        RepowatchToml::default().save(&config_path)?;
    }

    let config = RepowatchConfig::load(project_dir)?;
    config.open_jobs()?;

    if was_initialized {
        println!(
            "repowatch project already initialized at {}",
            config.config_dir.display()
        );
        println!("Database verified at {}", config.db_path().display());
    } else {
        println!(
            "Initialized repowatch project at {}",
            config.config_dir.display()
        );
        println!();
        println!("Created:");
        println!("  {}/", CONFIG_DIR);
        println!("  ├── repowatch.toml   # Queue, channel and GitHub settings");
        println!("  └── repowatch.db     # Jobs, statuses and cached results");
        println!();
        println!("Next steps:");
        println!("  1. Export GITHUB_TOKEN (or set github.token_env)");
        println!("  2. Run `repowatch serve` to start the admin API and workers");
        println!("  3. Run `repowatch dispatch analyze --owner <owner>` to queue work");
    }

    Ok(())
}

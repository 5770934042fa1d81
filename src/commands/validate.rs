use std::path::Path;

use anyhow::Result;

use crate::manifest::{self, Manifest};

pub(crate) fn run(path: &Path) -> Result<()> {
    let manifest = manifest::load(path)?;
    for line in report(path, &manifest) {
        println!("{line}");
    }
    Ok(())
}

fn report(path: &Path, manifest: &Manifest) -> Vec<String> {
    let tracked = manifest
        .services
        .iter()
        .filter(|service| service.repo.is_some())
        .count()
        + manifest
            .daemons
            .iter()
            .filter(|daemon| daemon.repo.is_some())
            .count();

    let mut lines = vec![
        "Manifest validation: OK".to_string(),
        format!("Path: {}", path.display()),
        format!("Services: {}", manifest.services.len()),
        format!("Daemons: {}", manifest.daemons.len()),
        format!("Repositories: {tracked}"),
    ];
    if manifest.services.is_empty() && manifest.daemons.is_empty() {
        lines.push("Warning: manifest declares nothing to supervise.".to_string());
    }
    lines
}

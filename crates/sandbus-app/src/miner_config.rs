//! File miner configuration inside the sandbox
//!
//! The miner reads `$XDG_CONFIG_HOME/tracker/tracker-miner-fs.cfg` when
//! `TRACKER_USE_CONFIG_FILES` is set. A template is written on first use;
//! the indexed locations are rewritten on every run.

use std::path::{Path, PathBuf};

use sandbus_core::prelude::*;

use crate::config::IndexSettings;

pub const MINER_CONFIG_DIR: &str = "tracker";
pub const MINER_CONFIG_FILENAME: &str = "tracker-miner-fs.cfg";

/// Group holding the location lists
pub const LOCATIONS_GROUP: &str = "General";

const CONFIG_TEMPLATE: &str = "\
[General]
verbosity=0
sched-idle=0
initial-sleep=0

[Monitors]
enable-monitors=false

[Indexing]
throttle=0
index-on-battery=true
index-on-battery-first-time=true
index-removable-media=false
index-optical-discs=false
low-disk-space-limit=-1
index-recursive-directories=;
index-single-directories=;
ignored-directories=;
ignored-directories-with-content=;
ignored-files=
crawling-interval=-1
removable-days-threshold=3

[Writeback]
enable-writeback=false
";

/// Path of the miner config under `config_home`
pub fn miner_config_path(config_home: &Path) -> PathBuf {
    config_home.join(MINER_CONFIG_DIR).join(MINER_CONFIG_FILENAME)
}

/// Write the template if needed, then set the indexed locations
///
/// Relative locations are resolved against `base`, entries naming a special
/// directory (`&DOWNLOAD`, `&MUSIC`, ...) are kept as they are.
pub fn apply_miner_config(config_home: &Path, index: &IndexSettings, base: &Path) -> Result<PathBuf> {
    let path = miner_config_path(config_home);
    debug!("Using config file {:?}", path);

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    if !path.exists() {
        std::fs::write(&path, CONFIG_TEMPLATE)?;
        debug!("Miner config file written");
    }

    if !index.recursive_directories.is_empty() {
        debug!("Using content locations: {:?}", index.recursive_directories);
    }
    if !index.single_directories.is_empty() {
        debug!("Using non-recursive content locations: {:?}", index.single_directories);
    }

    let content = std::fs::read_to_string(&path)?;
    let mut ini = IniDocument::parse(&content);
    ini.set(
        LOCATIONS_GROUP,
        "index-recursive-directories",
        &render_string_list(&resolve_locations(&index.recursive_directories, base)),
    );
    ini.set(
        LOCATIONS_GROUP,
        "index-single-directories",
        &render_string_list(&resolve_locations(&index.single_directories, base)),
    );
    ini.set(
        LOCATIONS_GROUP,
        "index-applications",
        if index.applications { "true" } else { "false" },
    );
    std::fs::write(&path, ini.render())?;

    Ok(path)
}

fn resolve_locations(locations: &[String], base: &Path) -> Vec<String> {
    locations
        .iter()
        .map(|location| {
            if location.starts_with('&') || Path::new(location).is_absolute() {
                location.clone()
            } else {
                base.join(location).to_string_lossy().into_owned()
            }
        })
        .collect()
}

/// Text form of a string array setting: `['a', 'b']`, or `@as []` when empty
pub fn render_string_list(items: &[String]) -> String {
    if items.is_empty() {
        return "@as []".to_string();
    }
    let quoted: Vec<String> = items
        .iter()
        .map(|item| format!("'{}'", item.replace('\\', "\\\\").replace('\'', "\\'")))
        .collect();
    format!("[{}]", quoted.join(", "))
}

// ─────────────────────────────────────────────────────────────────
// Key file handling
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct IniGroup {
    name: String,
    entries: Vec<(String, String)>,
}

/// Minimal key file: groups and `key=value` pairs in file order
///
/// Comments and blank lines are not preserved.
#[derive(Debug, Default)]
struct IniDocument {
    groups: Vec<IniGroup>,
}

impl IniDocument {
    fn parse(content: &str) -> Self {
        let mut doc = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                doc.groups.push(IniGroup {
                    name: name.trim().to_string(),
                    entries: Vec::new(),
                });
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                trace!("Ignoring key file line {:?}", line);
                continue;
            };
            if doc.groups.is_empty() {
                trace!("Ignoring key outside of a group: {:?}", line);
                continue;
            }
            if let Some(group) = doc.groups.last_mut() {
                group
                    .entries
                    .push((key.trim().to_string(), value.trim().to_string()));
            }
        }
        doc
    }

    fn set(&mut self, group: &str, key: &str, value: &str) {
        let index = match self.groups.iter().position(|g| g.name == group) {
            Some(index) => index,
            None => {
                self.groups.push(IniGroup {
                    name: group.to_string(),
                    entries: Vec::new(),
                });
                self.groups.len() - 1
            }
        };
        let entries = &mut self.groups[index].entries;
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => entries.push((key.to_string(), value.to_string())),
        }
    }

    #[cfg(test)]
    fn get(&self, group: &str, key: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|g| g.name == group)?
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for group in &self.groups {
            out.push('[');
            out.push_str(&group.name);
            out.push_str("]\n");
            for (key, value) in &group.entries {
                out.push_str(key);
                out.push('=');
                out.push_str(value);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}

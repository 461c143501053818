//! Layered `key = value` configuration, mirroring the three-file precedence
//! a libretro frontend uses to let a system, a core, and a player each have
//! an opinion about the same option: system defaults lose to core (pak)
//! defaults, which lose to whatever the user actually saved.
//!
//! A line of the form `-key = value` marks `key` as locked: once any layer
//! locks a key the lock sticks, even if a later layer still supplies a
//! fresh value for it. Locking only hides the option from the menu, it
//! never blocks the later layer from changing the value.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use atomicwrites::{AtomicFile, OverwriteBehavior::AllowOverwrite};

/// One `key = value` pair read out of a config file, plus whether any layer
/// locked it.
#[derive(Debug, Clone, Default)]
struct Entry {
    value: String,
    locked: bool,
}

/// The result of resolving a key through every layer that defined it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub value: String,
    pub locked: bool,
}

/// Where the user-scope file currently lives: console-wide, or shadowed by
/// a save tied to the running game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    None,
    Console,
    Game,
}

/// Parses a single config file's text into key/value pairs, ignoring blank
/// lines and anything that doesn't match `[-]key = value`.
fn parse(text: &str) -> HashMap<String, Entry> {
    let mut out = HashMap::new();
    for line in text.lines() {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(eq) = line.find(" = ") else { continue };
        let (mut key, value) = line.split_at(eq);
        let value = &value[3..];
        let locked = key.starts_with('-');
        if locked {
            key = &key[1..];
        }
        if key.is_empty() {
            continue;
        }
        out.insert(key.to_string(), Entry { value: value.to_string(), locked });
    }
    out
}

/// The three-layer stack, plus the two candidate paths for the user layer
/// (console-scoped and game-scoped).
pub struct Config {
    system: HashMap<String, Entry>,
    pak: HashMap<String, Entry>,
    user: HashMap<String, Entry>,
    console_path: PathBuf,
    game_path: PathBuf,
    scope: Scope,
}

impl Config {
    /// Loads the system and pak (core) layers, then the user layer: the
    /// game-scoped file shadows the console-scoped one outright when it
    /// exists, it is never merged with it.
    pub fn load(system_path: &Path, pak_path: &Path, console_path: &Path, game_path: &Path) -> Result<Self> {
        let system = read_layer(system_path)?;
        let pak = read_layer(pak_path)?;
        let (user, scope) = if game_path.exists() {
            (read_layer(game_path)?, Scope::Game)
        } else if console_path.exists() {
            (read_layer(console_path)?, Scope::Console)
        } else {
            (HashMap::new(), Scope::None)
        };

        Ok(Config {
            system,
            pak,
            user,
            console_path: console_path.to_path_buf(),
            game_path: game_path.to_path_buf(),
            scope,
        })
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Resolves `key` across all three layers: value comes from the
    /// highest-priority layer that defines it, lock is sticky across every
    /// layer that defined it at all.
    pub fn get(&self, key: &str) -> Option<Resolved> {
        let mut resolved: Option<Resolved> = None;
        for layer in [&self.system, &self.pak, &self.user] {
            if let Some(entry) = layer.get(key) {
                let locked = resolved.as_ref().map(|r| r.locked).unwrap_or(false) || entry.locked;
                resolved = Some(Resolved { value: entry.value.clone(), locked });
            }
        }
        resolved
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.user.entry(key.to_string()).or_default().value = value.to_string();
    }

    /// Writes the user layer. `console_scope = true` writes the console-wide
    /// file and deletes any game-scoped file shadowing it; otherwise it
    /// writes (or overwrites) the game-scoped file.
    pub fn write(&mut self, console_scope: bool) -> Result<()> {
        let path = if console_scope { &self.console_path } else { &self.game_path };

        let mut body = String::new();
        let mut keys: Vec<&String> = self.user.keys().collect();
        keys.sort();
        for key in keys {
            let entry = &self.user[key];
            let prefix = if entry.locked { "-" } else { "" };
            body.push_str(&format!("{prefix}{key} = {}\n", entry.value));
        }

        AtomicFile::new(path, AllowOverwrite)
            .write(|f| std::io::Write::write_all(f, body.as_bytes()))
            .with_context(|| format!("writing config to {}", path.display()))?;

        if console_scope {
            if self.game_path.exists() {
                fs::remove_file(&self.game_path)
                    .with_context(|| format!("removing shadowed game config {}", self.game_path.display()))?;
            }
            self.scope = Scope::Console;
        } else {
            self.scope = Scope::Game;
        }
        Ok(())
    }
}

fn read_layer(path: &Path) -> Result<HashMap<String, Entry>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(parse(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e).with_context(|| format!("reading config {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_layer_overrides_value() {
        let mut c = empty_config();
        c.system.insert("volume".into(), Entry { value: "5".into(), locked: false });
        c.pak.insert("volume".into(), Entry { value: "7".into(), locked: false });
        assert_eq!(c.get("volume").unwrap().value, "7");
    }

    #[test]
    fn lock_is_sticky_across_layers() {
        let mut c = empty_config();
        c.system.insert("volume".into(), Entry { value: "5".into(), locked: true });
        c.pak.insert("volume".into(), Entry { value: "7".into(), locked: false });
        let r = c.get("volume").unwrap();
        assert_eq!(r.value, "7");
        assert!(r.locked, "a lock from an earlier layer must not be cleared by a later unlocked value");
    }

    #[test]
    fn unknown_key_resolves_to_none() {
        let c = empty_config();
        assert!(c.get("does_not_exist").is_none());
    }

    #[test]
    fn parses_dash_prefixed_lock_lines() {
        let parsed = parse("-minarch_rewind_enabled = 1\nminarch_scaling = 2\n");
        assert!(parsed["minarch_rewind_enabled"].locked);
        assert_eq!(parsed["minarch_rewind_enabled"].value, "1");
        assert!(!parsed["minarch_scaling"].locked);
    }

    fn empty_config() -> Config {
        Config {
            system: HashMap::new(),
            pak: HashMap::new(),
            user: HashMap::new(),
            console_path: PathBuf::from("/dev/null"),
            game_path: PathBuf::from("/dev/null"),
            scope: Scope::None,
        }
    }
}

//! Host collaborators consumed by the capability surface.
//!
//! The plugin host never touches the GUI, the editor buffer or the
//! application settings directly. It reaches them through these traits,
//! bundled into a [`HostHandle`] at registry initialization.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

// ─── Collaborator traits ────────────────────────────────────────────

/// File access used by the `fs` table. Contents are raw bytes.
pub trait FileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn append(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn is_file(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    /// Create a directory and any missing parents.
    fn mkdir(&self, path: &Path) -> io::Result<()>;
    /// Entry names of a directory, sorted.
    fn list(&self, path: &Path) -> io::Result<Vec<String>>;
    fn canonical_path(&self, path: &Path) -> io::Result<PathBuf>;
}

/// Synchronous user prompts used by the `ui` table.
pub trait UserInteraction {
    /// `title` is empty when the script passed only the message.
    fn message(&self, title: &str, message: &str);
    fn confirm(&self, title: &str, message: &str) -> bool;
    /// `None` when the user cancels.
    fn input(&self, label: &str, default: &str) -> Option<String>;
    /// `None` when the user cancels.
    fn select(&self, items: &[String], default_index: usize) -> Option<String>;
    fn clipboard(&self) -> String;
    fn set_clipboard(&self, text: &str) -> bool;
}

/// Application settings used by the `settings` table.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> bool;
    fn has(&self, key: &str) -> bool;
    fn remove(&self, key: &str) -> bool;
}

/// Editor state used by the `editor` table.
pub trait EditorHandle {
    fn current_file(&self) -> Option<PathBuf>;
    fn open(&self, path: &Path) -> bool;
    fn save(&self) -> bool;
    /// Close `path`, or the current file when `None`.
    fn close(&self, path: Option<&Path>) -> bool;
}

// ─── Host handle ────────────────────────────────────────────────────

/// The collaborators handed to the registry by the embedding application.
#[derive(Clone)]
pub struct HostHandle {
    fs: Rc<dyn FileSystem>,
    ui: Rc<dyn UserInteraction>,
    settings: Rc<dyn KeyValueStore>,
    editor: Rc<dyn EditorHandle>,
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHandle").finish_non_exhaustive()
    }
}

impl HostHandle {
    /// Local filesystem, no GUI, in-memory settings, no editor.
    pub fn headless() -> Self {
        Self {
            fs: Rc::new(LocalFileSystem),
            ui: Rc::new(HeadlessInteraction::default()),
            settings: Rc::new(MemorySettings::default()),
            editor: Rc::new(NoEditor),
        }
    }

    pub fn with_file_system(mut self, fs: impl FileSystem + 'static) -> Self {
        self.fs = Rc::new(fs);
        self
    }

    pub fn with_interaction(mut self, ui: impl UserInteraction + 'static) -> Self {
        self.ui = Rc::new(ui);
        self
    }

    pub fn with_settings(mut self, settings: impl KeyValueStore + 'static) -> Self {
        self.settings = Rc::new(settings);
        self
    }

    /// Share a settings store the host keeps its own handle to.
    pub fn with_shared_settings(mut self, settings: Rc<dyn KeyValueStore>) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_editor(mut self, editor: impl EditorHandle + 'static) -> Self {
        self.editor = Rc::new(editor);
        self
    }

    pub fn fs(&self) -> &dyn FileSystem {
        self.fs.as_ref()
    }

    pub fn ui(&self) -> &dyn UserInteraction {
        self.ui.as_ref()
    }

    pub fn settings(&self) -> &dyn KeyValueStore {
        self.settings.as_ref()
    }

    pub fn editor(&self) -> &dyn EditorHandle {
        self.editor.as_ref()
    }
}

// ─── Default collaborators ──────────────────────────────────────────

/// [`FileSystem`] over `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn append(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(contents)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn mkdir(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn list(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn canonical_path(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::canonicalize(path)
    }
}

/// [`UserInteraction`] without a GUI.
///
/// Messages go to the log, prompts answer with their defaults and the
/// clipboard is process-local.
#[derive(Debug, Default)]
pub struct HeadlessInteraction {
    assume_yes: bool,
    clipboard: RefCell<String>,
}

impl HeadlessInteraction {
    /// Answer every confirmation with `yes`.
    pub fn assume_yes() -> Self {
        Self {
            assume_yes: true,
            ..Self::default()
        }
    }
}

impl UserInteraction for HeadlessInteraction {
    fn message(&self, title: &str, message: &str) {
        tracing::info!(target: "nnp_plugin::ui", title, "{message}");
    }

    fn confirm(&self, title: &str, message: &str) -> bool {
        tracing::info!(target: "nnp_plugin::ui", title, answer = self.assume_yes, "confirm: {message}");
        self.assume_yes
    }

    fn input(&self, label: &str, default: &str) -> Option<String> {
        tracing::debug!(target: "nnp_plugin::ui", label, "input answered with default");
        Some(default.to_string())
    }

    fn select(&self, items: &[String], default_index: usize) -> Option<String> {
        items.get(default_index).cloned()
    }

    fn clipboard(&self) -> String {
        self.clipboard.borrow().clone()
    }

    fn set_clipboard(&self, text: &str) -> bool {
        *self.clipboard.borrow_mut() = text.to_string();
        true
    }
}

/// [`KeyValueStore`] held in memory.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RefCell<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.values.borrow().clone()
    }
}

impl KeyValueStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> bool {
        self.values
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        true
    }

    fn has(&self, key: &str) -> bool {
        self.values.borrow().contains_key(key)
    }

    fn remove(&self, key: &str) -> bool {
        self.values.borrow_mut().remove(key).is_some()
    }
}

/// [`KeyValueStore`] persisted to a JSON file on every change.
#[derive(Debug)]
pub struct JsonSettingsStore {
    path: PathBuf,
    values: RefCell<BTreeMap<String, String>>,
}

impl JsonSettingsStore {
    /// Open the store at `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable settings file");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            values: RefCell::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> bool {
        let write = || -> Result<(), crate::error::PluginError> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(&*self.values.borrow())?;
            std::fs::write(&self.path, json)?;
            Ok(())
        };
        match write() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to persist settings");
                false
            }
        }
    }
}

impl KeyValueStore for JsonSettingsStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> bool {
        self.values
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        self.persist()
    }

    fn has(&self, key: &str) -> bool {
        self.values.borrow().contains_key(key)
    }

    fn remove(&self, key: &str) -> bool {
        let removed = self.values.borrow_mut().remove(key).is_some();
        removed && self.persist()
    }
}

/// [`EditorHandle`] for hosts without an editor buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEditor;

impl EditorHandle for NoEditor {
    fn current_file(&self) -> Option<PathBuf> {
        None
    }

    fn open(&self, _path: &Path) -> bool {
        false
    }

    fn save(&self) -> bool {
        false
    }

    fn close(&self, _path: Option<&Path>) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── LocalFileSystem ─────────────────────────────────────────────

    #[test]
    fn test_local_fs_write_read_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        let fs = LocalFileSystem;

        fs.write(&path, b"one").unwrap();
        fs.append(&path, b"+two").unwrap();
        assert_eq!(fs.read(&path).unwrap(), b"one+two");
        assert!(fs.exists(&path));
        assert!(fs.is_file(&path));
        assert!(!fs.is_dir(&path));
    }

    #[test]
    fn test_local_fs_bytes_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latin1.txt");
        let fs = LocalFileSystem;

        fs.write(&path, b"caf\xe9").unwrap();
        fs.append(&path, &[0xff, 0x00]).unwrap();
        assert_eq!(fs.read(&path).unwrap(), b"caf\xe9\xff\x00");
    }

    #[test]
    fn test_local_fs_read_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalFileSystem.read(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_local_fs_list_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem;
        fs.mkdir(&dir.path().join("b/nested")).unwrap();
        fs.write(&dir.path().join("c.txt"), b"").unwrap();
        fs.write(&dir.path().join("a.txt"), b"").unwrap();
        assert_eq!(fs.list(dir.path()).unwrap(), vec!["a.txt", "b", "c.txt"]);
        assert!(fs.list(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_local_fs_canonical_path() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem;
        fs.mkdir(&dir.path().join("sub")).unwrap();
        let canonical = fs.canonical_path(&dir.path().join("sub/..")).unwrap();
        assert_eq!(canonical, fs.canonical_path(dir.path()).unwrap());
    }

    // ── HeadlessInteraction ─────────────────────────────────────────

    #[test]
    fn test_headless_defaults() {
        let ui = HeadlessInteraction::default();
        assert!(!ui.confirm("Deploy", "proceed?"));
        assert_eq!(ui.input("Name", "anon").as_deref(), Some("anon"));
        let items = vec!["a".to_string(), "b".to_string()];
        assert_eq!(ui.select(&items, 1).as_deref(), Some("b"));
        assert_eq!(ui.select(&items, 5), None);
    }

    #[test]
    fn test_headless_assume_yes() {
        assert!(HeadlessInteraction::assume_yes().confirm("", "proceed?"));
    }

    #[test]
    fn test_headless_clipboard() {
        let ui = HeadlessInteraction::default();
        assert_eq!(ui.clipboard(), "");
        assert!(ui.set_clipboard("copied"));
        assert_eq!(ui.clipboard(), "copied");
    }

    // ── Settings stores ─────────────────────────────────────────────

    #[test]
    fn test_memory_settings() {
        let store = MemorySettings::default();
        assert_eq!(store.get("k"), None);
        assert!(store.set("k", "v"));
        assert!(store.has("k"));
        assert_eq!(store.get("k").as_deref(), Some("v"));
        assert!(store.remove("k"));
        assert!(!store.remove("k"));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_json_settings_persist_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/settings.json");

        let store = JsonSettingsStore::open(&path);
        assert!(store.set("theme", "dark"));
        assert!(store.set("font", "mono"));
        assert!(store.remove("font"));
        assert!(path.is_file());

        let reopened = JsonSettingsStore::open(&path);
        assert_eq!(reopened.get("theme").as_deref(), Some("dark"));
        assert!(!reopened.has("font"));
        assert_eq!(reopened.path(), path);
    }

    #[test]
    fn test_json_settings_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = JsonSettingsStore::open(&path);
        assert!(!store.has("anything"));
    }

    // ── Host handle ─────────────────────────────────────────────────

    #[test]
    fn test_no_editor() {
        let host = HostHandle::headless();
        assert_eq!(host.editor().current_file(), None);
        assert!(!host.editor().open(Path::new("a.txt")));
        assert!(!host.editor().save());
        assert!(!host.editor().close(None));
    }

    #[test]
    fn test_shared_settings_visible_to_host() {
        let shared: Rc<MemorySettings> = Rc::new(MemorySettings::default());
        let host = HostHandle::headless().with_shared_settings(shared.clone());
        host.settings().set("k", "v");
        assert_eq!(shared.get("k").as_deref(), Some("v"));
    }
}

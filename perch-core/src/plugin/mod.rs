//! Plugins and the plugin host.
//!
//! A plugin is a value implementing [`Plugin`], built by a factory that
//! is registered in the [`Catalog`] under its name. Plugin manifests
//! (`plugin.toml`) found in `directories.plugins` add aliases of compiled
//! plugins with their own name, description and configuration defaults.
//!
//! The [`PluginHost`] owns the loaded plugins in precedence order and
//! keeps a [`CommandIndex`] snapshot that the dispatcher resolves names
//! against. Plugins never touch the host directly: things like loading
//! another plugin are returned as [`Action`]s and applied after the call.

pub mod order;

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;

pub use order::Precedence;

use crate::config::{Decl, Registry, Scope, Value};
use crate::context::Context;
use crate::db::User;
use crate::dispatch::CommandError;
use crate::dispatch::converter::{Arg, Conv};
use crate::dispatch::reply::{Reply, ReplyOpts, ReplyTo};
use crate::message::Message;
use crate::state::NetworkState;
use crate::worker::Job;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("no plugin named {0} is available")]
    NotFound(String),
    #[error("{0} is already loaded")]
    AlreadyLoaded(String),
    #[error("{0} is not loaded")]
    NotLoaded(String),
    #[error("{plugin} has no command named {command}")]
    NoSuchCommand { plugin: String, command: String },
    #[error("{plugin} already has a command named {name}")]
    RenameConflict { plugin: String, name: String },
    #[error("{path}: {reason}")]
    Manifest { path: String, reason: String },
    #[error("plugin I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Commands ──

/// A command a plugin offers.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    /// First line is the argument syntax, the rest a description.
    pub help: String,
    pub args: Vec<Conv>,
    /// Capability the caller must hold before arguments are converted.
    pub capability: Option<String>,
}

impl CommandSpec {
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            help: help.to_string(),
            args: Vec::new(),
            capability: None,
        }
    }

    pub fn args(mut self, args: Vec<Conv>) -> Self {
        self.args = args;
        self
    }

    pub fn capability(mut self, cap: &str) -> Self {
        self.capability = Some(cap.to_string());
        self
    }
}

/// Something a plugin asks the session to do once its call returns.
#[derive(Debug)]
pub enum Action {
    Send(Message),
    /// Send with a `label` tag; the server's answer is replied to the caller.
    Labeled(Message),
    /// Release the next held reply chunk for this nick.
    More { nick: String },
    Load(String),
    Unload(String),
    Reload(String),
    Rename { plugin: String, from: String, to: String },
    Unrename { plugin: String, name: String },
    Disable(String),
    Enable(String),
    Schedule { name: String, owner: String, at: f64, period: Option<f64> },
    Unschedule(String),
    /// Run off the session loop; the result is replied when it arrives.
    Job(Job),
    /// Write the configuration and databases to disk.
    Flush,
    /// Shut the whole bot down.
    Shutdown(String),
}

/// The view a plugin gets of one call: who asked and where, plus the
/// shared services. Replies and actions are collected and applied after
/// the call returns.
pub struct Invocation<'a> {
    pub ctx: &'a Context,
    pub net: &'a NetworkState,
    pub index: &'a CommandIndex,
    pub msg: Option<&'a Message>,
    pub plugin: String,
    pub command: String,
    reply_to: Option<ReplyTo>,
    replies: Vec<Reply>,
    actions: Vec<Action>,
}

impl<'a> Invocation<'a> {
    pub fn new(
        ctx: &'a Context,
        net: &'a NetworkState,
        index: &'a CommandIndex,
        msg: Option<&'a Message>,
        reply_to: Option<ReplyTo>,
    ) -> Self {
        Self {
            ctx,
            net,
            index,
            msg,
            plugin: String::new(),
            command: String::new(),
            reply_to,
            replies: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn reply_to(&self) -> Option<&ReplyTo> {
        self.reply_to.as_ref()
    }

    pub fn nick(&self) -> &str {
        self.reply_to.as_ref().map_or("", |r| r.nick.as_str())
    }

    pub fn hostmask(&self) -> &str {
        self.reply_to.as_ref().map_or("", |r| r.hostmask.as_str())
    }

    pub fn channel(&self) -> Option<&str> {
        self.reply_to.as_ref().and_then(|r| r.channel.as_deref())
    }

    pub fn reply(&mut self, text: impl Into<String>) {
        self.reply_with(text, ReplyOpts::default());
    }

    pub fn reply_with(&mut self, text: impl Into<String>, opts: ReplyOpts) {
        let text = text.into();
        if self.reply_to.is_none() && opts.to.is_none() {
            tracing::debug!(plugin = %self.plugin, %text, "Dropping reply with no destination");
            return;
        }
        self.replies.push(Reply::new(text, opts));
    }

    /// The configured success reply, optionally followed by `extra`.
    pub fn reply_success(&mut self, extra: Option<&str>) {
        let mut text = self.ctx.registry.string("replies.success", Some(&self.net.network), self.channel());
        if let Some(extra) = extra {
            text.push(' ');
            text.push_str(extra);
        }
        self.reply(text);
    }

    pub fn send(&mut self, msg: Message) {
        self.actions.push(Action::Send(msg));
    }

    pub fn act(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn schedule(&mut self, name: &str, at: f64, period: Option<f64>) {
        let owner = self.plugin.clone();
        self.actions.push(Action::Schedule { name: name.to_string(), owner, at, period });
    }

    /// Run `f` off the session loop and reply with its result.
    pub fn defer(
        &mut self,
        timeout: std::time::Duration,
        f: impl FnOnce() -> Result<String, CommandError> + Send + 'static,
    ) {
        match self.reply_to.clone() {
            Some(to) => self.actions.push(Action::Job(Job::blocking(to, timeout, f))),
            None => tracing::debug!(plugin = %self.plugin, "Deferred work with no reply destination dropped"),
        }
    }

    pub fn check_capability(&self, capability: &str) -> bool {
        self.ctx.check_capability(self.hostmask(), capability)
    }

    /// The caller's registered user, if recognized.
    pub fn user(&self) -> Option<User> {
        self.ctx.users.get_user(self.hostmask()).ok()
    }

    // ── Plugin configuration, scoped to this network and channel ──

    fn key(&self, key: &str) -> String {
        format!("plugins.{}.{key}", self.plugin)
    }

    pub fn config(&self, key: &str) -> Option<Value> {
        self.ctx
            .registry
            .get(&self.key(key), Some(&self.net.network), self.channel())
            .ok()
    }

    pub fn config_bool(&self, key: &str) -> bool {
        self.ctx.registry.bool(&self.key(key), Some(&self.net.network), self.channel())
    }

    pub fn config_int(&self, key: &str) -> i64 {
        self.ctx.registry.int(&self.key(key), Some(&self.net.network), self.channel())
    }

    pub fn config_string(&self, key: &str) -> String {
        self.ctx.registry.string(&self.key(key), Some(&self.net.network), self.channel())
    }

    pub fn into_parts(self) -> (Vec<Reply>, Vec<Action>) {
        (self.replies, self.actions)
    }

    pub(crate) fn bind(&mut self, plugin: &str, command: &str) {
        self.plugin = plugin.to_string();
        self.command = command.to_string();
    }
}

/// A bot extension.
///
/// Every method has a default, so a plugin implements only what it needs.
pub trait Plugin: Send {
    fn description(&self) -> &str {
        ""
    }

    fn commands(&self) -> Vec<CommandSpec> {
        Vec::new()
    }

    /// Run `command` (its original, un-renamed name) with converted args.
    fn call(&mut self, command: &str, inv: &mut Invocation<'_>, args: Vec<Arg>) -> Result<(), CommandError> {
        let _ = (inv, args);
        Err(CommandError::InvalidCommand(command.to_string()))
    }

    /// Every inbound message from a non-ignored source.
    fn on_message(&mut self, inv: &mut Invocation<'_>, msg: &Message) {
        let _ = (inv, msg);
    }

    /// An addressed message named no command. Return `true` when handled.
    fn invalid_command(&mut self, inv: &mut Invocation<'_>, tokens: &[String]) -> bool {
        let _ = (inv, tokens);
        false
    }

    /// Rewrite or drop an outbound message.
    fn out_filter(&mut self, msg: Message, net: &NetworkState) -> Option<Message> {
        let _ = net;
        Some(msg)
    }

    /// A scheduled event this plugin owns fired.
    fn on_event(&mut self, inv: &mut Invocation<'_>, name: &str) {
        let _ = (inv, name);
    }

    /// Settings registered under `plugins.<Name>.` at load.
    fn config(&self) -> Vec<Decl> {
        Vec::new()
    }

    fn precedence(&self) -> Precedence {
        Precedence::default()
    }

    /// State carried across a reload.
    fn preserve(&mut self) -> Option<Box<dyn Any + Send>> {
        None
    }

    fn restore(&mut self, state: Box<dyn Any + Send>) {
        let _ = state;
    }

    /// Called once before the plugin is dropped.
    fn die(&mut self) {}
}

// ── Command index ──

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub plugin: String,
    /// Name it is invoked by, after renames.
    pub name: String,
    /// Name the plugin knows it by.
    pub original: String,
    pub help: String,
    pub args: Vec<Conv>,
    pub capability: Option<String>,
}

impl IndexEntry {
    pub fn syntax(&self) -> &str {
        self.help.lines().next().unwrap_or_default().trim()
    }

    pub fn description(&self) -> String {
        self.help.lines().skip(1).map(str::trim).collect::<Vec<_>>().join(" ").trim().to_string()
    }

    /// `(name <args>) -- description`
    pub fn usage(&self) -> String {
        let syntax = self.syntax();
        let head = if syntax.is_empty() { self.name.clone() } else { format!("{} {syntax}", self.name) };
        let description = self.description();
        if description.is_empty() { format!("({head})") } else { format!("({head}) -- {description}") }
    }
}

#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: String,
    pub description: String,
    pub commands: Vec<String>,
}

/// Immutable snapshot of the loaded commands.
#[derive(Debug, Clone, Default)]
pub struct CommandIndex {
    commands: BTreeMap<String, Vec<IndexEntry>>,
    plugins: BTreeMap<String, PluginInfo>,
}

impl CommandIndex {
    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(&name.to_lowercase())
    }

    /// Every plugin entry answering to `name`.
    pub fn providers(&self, name: &str) -> &[IndexEntry] {
        self.commands.get(&name.to_lowercase()).map_or(&[], Vec::as_slice)
    }

    pub fn lookup(&self, plugin: &str, name: &str) -> Option<&IndexEntry> {
        self.providers(name).iter().find(|e| e.plugin.eq_ignore_ascii_case(plugin))
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginInfo> {
        self.plugins.get(&name.to_lowercase())
    }

    pub fn plugins(&self) -> impl Iterator<Item = &PluginInfo> {
        self.plugins.values()
    }

    pub fn command_names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}

// ── Catalog ──

pub type Factory = Arc<dyn Fn(&str) -> Box<dyn Plugin> + Send + Sync>;

#[derive(Clone)]
struct CatalogEntry {
    name: String,
    factory: Factory,
    description: Option<String>,
    defaults: BTreeMap<String, String>,
    source: Option<PathBuf>,
}

/// Every plugin that can be loaded, by name.
#[derive(Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.values().map(|e| &e.name)).finish()
    }
}

/// `plugin.toml`: a named alias of a compiled plugin.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub name: String,
    pub base: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Defaults for the base plugin's settings, by relative key.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&str) -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.to_lowercase(),
            CatalogEntry {
                name: name.to_string(),
                factory: Arc::new(factory),
                description: None,
                defaults: BTreeMap::new(),
                source: None,
            },
        );
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.values().map(|e| e.name.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_lowercase())
    }

    pub fn add_manifest(&mut self, manifest: Manifest, source: Option<&Path>) -> Result<(), PluginError> {
        let path = source.map_or_else(|| manifest.name.clone(), |p| p.display().to_string());
        let Some(base) = self.entries.get(&manifest.base.to_lowercase()).cloned() else {
            return Err(PluginError::Manifest { path, reason: format!("unknown base plugin {}", manifest.base) });
        };
        if manifest.name.is_empty() || manifest.name.contains(|c: char| !c.is_alphanumeric() && c != '_') {
            return Err(PluginError::Manifest { path, reason: format!("invalid plugin name {:?}", manifest.name) });
        }
        if self.contains(&manifest.name) {
            return Err(PluginError::Manifest { path, reason: format!("{} is already defined", manifest.name) });
        }
        self.entries.insert(
            manifest.name.to_lowercase(),
            CatalogEntry {
                name: manifest.name,
                factory: base.factory,
                description: manifest.description,
                defaults: manifest.config,
                source: source.map(Path::to_path_buf),
            },
        );
        Ok(())
    }

    /// Read manifests from `dir`: `*.toml` files and `*/plugin.toml`.
    /// Bad manifests are logged and skipped.
    pub fn discover(&mut self, dir: &Path) -> Result<usize, PluginError> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                let manifest = path.join("plugin.toml");
                if manifest.is_file() {
                    paths.push(manifest);
                }
            } else if path.extension().is_some_and(|e| e == "toml") {
                paths.push(path);
            }
        }
        paths.sort();
        let mut added = 0;
        for path in paths {
            let result = std::fs::read_to_string(&path)
                .map_err(PluginError::from)
                .and_then(|text| {
                    toml::from_str::<Manifest>(&text).map_err(|e| PluginError::Manifest {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })
                })
                .and_then(|manifest| self.add_manifest(manifest, Some(&path)));
            match result {
                Ok(()) => added += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping plugin manifest"),
            }
        }
        tracing::info!(dir = %dir.display(), added, "Plugin manifests discovered");
        Ok(added)
    }
}

// ── Host ──

struct Loaded {
    name: String,
    plugin: Box<dyn Plugin>,
    precedence: Precedence,
}

pub type SharedHost = Arc<Mutex<PluginHost>>;

pub struct PluginHost {
    catalog: Catalog,
    registry: Arc<Registry>,
    loaded: Vec<Loaded>,
    index: Arc<CommandIndex>,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("catalog", &self.catalog)
            .field("loaded", &self.loaded())
            .finish()
    }
}

impl PluginHost {
    pub fn new(catalog: Catalog, registry: Arc<Registry>) -> Self {
        Self {
            catalog,
            registry,
            loaded: Vec::new(),
            index: Arc::new(CommandIndex::default()),
        }
    }

    pub fn shared(self) -> SharedHost {
        Arc::new(Mutex::new(self))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn index(&self) -> Arc<CommandIndex> {
        self.index.clone()
    }

    /// Loaded plugin names in dispatch order.
    pub fn loaded(&self) -> Vec<String> {
        self.loaded.iter().map(|l| l.name.clone()).collect()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.loaded.iter().position(|l| l.name.eq_ignore_ascii_case(name))
    }

    /// Load every catalog plugin whose `plugins.<Name>` setting is on.
    pub fn load_configured(&mut self) -> Vec<(String, PluginError)> {
        let mut failures = Vec::new();
        for name in self.catalog.names() {
            if self.registry.bool(&format!("plugins.{name}"), None, None) && !self.is_loaded(&name) {
                if let Err(e) = self.load(&name) {
                    tracing::error!(plugin = %name, error = %e, "Failed to load plugin");
                    failures.push((name, e));
                }
            }
        }
        failures
    }

    /// Load `name`; returns its canonical name.
    pub fn load(&mut self, name: &str) -> Result<String, PluginError> {
        if let Some(i) = self.position(name) {
            return Err(PluginError::AlreadyLoaded(self.loaded[i].name.clone()));
        }
        let entry = self
            .catalog
            .entries
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        let plugin = (entry.factory)(&entry.name);
        self.register_config(&entry, plugin.as_ref());
        let precedence = plugin.precedence();
        self.loaded.push(Loaded { name: entry.name.clone(), plugin, precedence });
        self.reorder();
        self.rebuild();
        tracing::info!(plugin = %entry.name, source = ?entry.source, "Plugin loaded");
        Ok(entry.name)
    }

    fn register_config(&self, entry: &CatalogEntry, plugin: &dyn Plugin) {
        for mut decl in plugin.config() {
            if let Some(raw) = entry.defaults.get(&decl.name) {
                match decl.kind.parse(raw) {
                    Ok(value) => decl.default = value,
                    Err(reason) => {
                        tracing::warn!(plugin = %entry.name, key = %decl.name, %reason, "Ignoring manifest default")
                    }
                }
            }
            decl.name = if decl.name.is_empty() {
                format!("plugins.{}", entry.name)
            } else {
                format!("plugins.{}.{}", entry.name, decl.name)
            };
            self.registry.register(decl);
        }
    }

    pub fn unload(&mut self, name: &str) -> Result<String, PluginError> {
        let i = self.position(name).ok_or_else(|| PluginError::NotLoaded(name.to_string()))?;
        let mut loaded = self.loaded.remove(i);
        loaded.plugin.die();
        self.rebuild();
        tracing::info!(plugin = %loaded.name, "Plugin unloaded");
        Ok(loaded.name)
    }

    /// Replace a plugin with a fresh instance, carrying preserved state.
    pub fn reload(&mut self, name: &str) -> Result<String, PluginError> {
        let i = self.position(name).ok_or_else(|| PluginError::NotLoaded(name.to_string()))?;
        let canonical = self.loaded[i].name.clone();
        let entry = self
            .catalog
            .entries
            .get(&canonical.to_lowercase())
            .cloned()
            .ok_or_else(|| PluginError::NotFound(canonical.clone()))?;
        let old = &mut self.loaded[i].plugin;
        let state = old.preserve();
        old.die();
        let mut fresh = (entry.factory)(&entry.name);
        if let Some(state) = state {
            fresh.restore(state);
        }
        self.register_config(&entry, fresh.as_ref());
        self.loaded[i].precedence = fresh.precedence();
        self.loaded[i].plugin = fresh;
        self.reorder();
        self.rebuild();
        tracing::info!(plugin = %canonical, "Plugin reloaded");
        Ok(canonical)
    }

    /// Call `plugin`'s command `from` by `to` from now on.
    pub fn rename(&mut self, plugin: &str, from: &str, to: &str) -> Result<(), PluginError> {
        let i = self.position(plugin).ok_or_else(|| PluginError::NotLoaded(plugin.to_string()))?;
        let name = self.loaded[i].name.clone();
        let (from, to) = (from.to_lowercase(), to.to_lowercase());
        let originals: Vec<String> = self.loaded[i].plugin.commands().into_iter().map(|c| c.name).collect();
        if !originals.contains(&from) {
            return Err(PluginError::NoSuchCommand { plugin: name, command: from });
        }
        let mut renames = self.renames(&name);
        let taken = renames.values().any(|v| *v == to)
            || originals.iter().any(|o| *o == to && !renames.contains_key(o));
        if taken {
            return Err(PluginError::RenameConflict { plugin: name, name: to });
        }
        renames.insert(from, to);
        self.store_renames(&name, &renames);
        self.rebuild();
        Ok(())
    }

    /// Undo a rename; `name` may be the original or the new name.
    pub fn unrename(&mut self, plugin: &str, name: &str) -> Result<(), PluginError> {
        let i = self.position(plugin).ok_or_else(|| PluginError::NotLoaded(plugin.to_string()))?;
        let canonical = self.loaded[i].name.clone();
        let name = name.to_lowercase();
        let mut renames = self.renames(&canonical);
        let before = renames.len();
        renames.retain(|from, to| *from != name && *to != name);
        if renames.len() == before {
            return Err(PluginError::NoSuchCommand { plugin: canonical, command: name });
        }
        self.store_renames(&canonical, &renames);
        self.rebuild();
        Ok(())
    }

    fn renames(&self, plugin: &str) -> BTreeMap<String, String> {
        self.registry
            .set_of(&format!("commands.renames.{plugin}"), None, None)
            .iter()
            .filter_map(|pair| pair.split_once('='))
            .map(|(a, b)| (a.to_lowercase(), b.to_lowercase()))
            .collect()
    }

    fn store_renames(&self, plugin: &str, renames: &BTreeMap<String, String>) {
        let value = Value::set(renames.iter().map(|(a, b)| format!("{a}={b}")));
        if let Err(e) = self.registry.set_value(&format!("commands.renames.{plugin}"), &Scope::global(), value) {
            tracing::warn!(%plugin, error = %e, "Could not store command renames");
        }
    }

    /// Hide `name` (`command` or `Plugin.command`) from dispatch.
    pub fn disable(&mut self, name: &str) {
        let mut disabled = self.registry.set_of("commands.disabled", None, None);
        disabled.insert(name.to_lowercase());
        self.store_disabled(disabled);
    }

    pub fn enable(&mut self, name: &str) -> bool {
        let mut disabled = self.registry.set_of("commands.disabled", None, None);
        let removed = disabled.remove(&name.to_lowercase());
        self.store_disabled(disabled);
        removed
    }

    fn store_disabled(&mut self, disabled: BTreeSet<String>) {
        if let Err(e) = self.registry.set_value("commands.disabled", &Scope::global(), Value::Set(disabled)) {
            tracing::warn!(error = %e, "Could not store disabled commands");
        }
        self.rebuild();
    }

    fn reorder(&mut self) {
        let keys: Vec<(&str, &Precedence)> = self.loaded.iter().map(|l| (l.name.as_str(), &l.precedence)).collect();
        let order = order::order(&keys);
        let mut slots: Vec<Option<Loaded>> = std::mem::take(&mut self.loaded).into_iter().map(Some).collect();
        self.loaded = order.into_iter().filter_map(|i| slots[i].take()).collect();
    }

    /// Rebuild the command index from the loaded plugins.
    pub fn rebuild(&mut self) {
        let disabled: BTreeSet<String> = self
            .registry
            .set_of("commands.disabled", None, None)
            .into_iter()
            .map(|d| d.to_lowercase())
            .collect();
        let mut index = CommandIndex::default();
        for loaded in &self.loaded {
            let renames = self.renames(&loaded.name);
            let mut names = Vec::new();
            for spec in loaded.plugin.commands() {
                let invoked = renames.get(&spec.name).cloned().unwrap_or_else(|| spec.name.clone());
                let qualified = format!("{}.{invoked}", loaded.name.to_lowercase());
                if disabled.contains(&invoked) || disabled.contains(&qualified) {
                    continue;
                }
                names.push(invoked.clone());
                index.commands.entry(invoked.clone()).or_default().push(IndexEntry {
                    plugin: loaded.name.clone(),
                    name: invoked,
                    original: spec.name,
                    help: spec.help,
                    args: spec.args,
                    capability: spec.capability,
                });
            }
            names.sort();
            let description = self
                .catalog
                .entries
                .get(&loaded.name.to_lowercase())
                .and_then(|e| e.description.clone())
                .unwrap_or_else(|| loaded.plugin.description().to_string());
            index.plugins.insert(
                loaded.name.to_lowercase(),
                PluginInfo { name: loaded.name.clone(), description, commands: names },
            );
        }
        self.index = Arc::new(index);
    }

    // ── Calls ──

    /// Run a command; a panicking plugin is contained and reported.
    pub fn call(
        &mut self,
        entry: &IndexEntry,
        inv: &mut Invocation<'_>,
        args: Vec<Arg>,
    ) -> Result<(), CommandError> {
        let i = self.position(&entry.plugin).ok_or_else(|| CommandError::InvalidCommand(entry.name.clone()))?;
        inv.bind(&entry.plugin, &entry.name);
        let plugin = &mut self.loaded[i].plugin;
        match catch_unwind(AssertUnwindSafe(|| plugin.call(&entry.original, inv, args))) {
            Ok(result) => result,
            Err(panic) => {
                tracing::error!(plugin = %entry.plugin, command = %entry.name, panic = %panic_text(&panic), "Plugin panicked");
                Err(CommandError::Panicked)
            }
        }
    }

    pub fn run_hooks(&mut self, inv: &mut Invocation<'_>, msg: &Message) {
        for loaded in &mut self.loaded {
            inv.bind(&loaded.name, "");
            let plugin = &mut loaded.plugin;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| plugin.on_message(inv, msg))) {
                tracing::error!(plugin = %loaded.name, panic = %panic_text(&panic), "Plugin panicked in message hook");
            }
        }
    }

    /// Offer an unknown command to each plugin until one handles it.
    pub fn invalid_command(&mut self, inv: &mut Invocation<'_>, tokens: &[String]) -> bool {
        for loaded in &mut self.loaded {
            inv.bind(&loaded.name, "");
            let plugin = &mut loaded.plugin;
            match catch_unwind(AssertUnwindSafe(|| plugin.invalid_command(inv, tokens))) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(panic) => {
                    tracing::error!(plugin = %loaded.name, panic = %panic_text(&panic), "Plugin panicked handling invalid command")
                }
            }
        }
        false
    }

    pub fn fire_event(&mut self, plugin: &str, name: &str, inv: &mut Invocation<'_>) {
        let Some(i) = self.position(plugin) else {
            tracing::debug!(%plugin, event = %name, "Event for a plugin that is not loaded");
            return;
        };
        let loaded = &mut self.loaded[i];
        inv.bind(&loaded.name, "");
        let target = &mut loaded.plugin;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| target.on_event(inv, name))) {
            tracing::error!(plugin = %loaded.name, event = %name, panic = %panic_text(&panic), "Plugin panicked in event");
        }
    }

    /// Pass an outbound message through every plugin's filter.
    pub fn filter_outbound(&mut self, msg: Message, net: &NetworkState) -> Option<Message> {
        let mut msg = msg;
        for loaded in &mut self.loaded {
            let plugin = &mut loaded.plugin;
            match catch_unwind(AssertUnwindSafe(|| plugin.out_filter(msg.clone(), net))) {
                Ok(Some(next)) => msg = next,
                Ok(None) => {
                    tracing::debug!(plugin = %loaded.name, command = %msg.command, "Outbound message dropped by filter");
                    return None;
                }
                Err(panic) => {
                    tracing::error!(plugin = %loaded.name, panic = %panic_text(&panic), "Plugin panicked in outbound filter")
                }
            }
        }
        Some(msg)
    }

    /// Tell every plugin to die, in reverse order.
    pub fn shutdown(&mut self) {
        for loaded in self.loaded.iter_mut().rev() {
            loaded.plugin.die();
        }
        self.loaded.clear();
        self.rebuild();
    }
}

fn panic_text(panic: &Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    struct Echo;

    impl Plugin for Echo {
        fn description(&self) -> &str {
            "Repeats things."
        }

        fn commands(&self) -> Vec<CommandSpec> {
            vec![
                CommandSpec::new("echo", "<text>\nReturns <text>.").args(vec![Conv::Text]),
                CommandSpec::new("ping", "\nAnswers pong."),
            ]
        }

        fn call(&mut self, command: &str, inv: &mut Invocation<'_>, args: Vec<Arg>) -> Result<(), CommandError> {
            match command {
                "echo" => inv.reply(args[0].to_string()),
                "ping" => inv.reply("pong"),
                _ => panic!("boom"),
            }
            Ok(())
        }

        fn config(&self) -> Vec<Decl> {
            vec![Decl::string("prefix", "").channel()]
        }
    }

    struct Counter {
        count: u32,
    }

    impl Plugin for Counter {
        fn commands(&self) -> Vec<CommandSpec> {
            vec![CommandSpec::new("echo", "\nCounts.")]
        }

        fn preserve(&mut self) -> Option<Box<dyn Any + Send>> {
            Some(Box::new(self.count))
        }

        fn restore(&mut self, state: Box<dyn Any + Send>) {
            if let Ok(count) = state.downcast::<u32>() {
                self.count = *count;
            }
        }

        fn out_filter(&mut self, mut msg: Message, _net: &NetworkState) -> Option<Message> {
            self.count += 1;
            if msg.params.get(1).is_some_and(|t| t.contains("secret")) {
                return None;
            }
            if let Some(text) = msg.params.get_mut(1) {
                text.push_str(" [filtered]");
            }
            Some(msg)
        }

        fn precedence(&self) -> Precedence {
            Precedence::before(&["Echo"])
        }
    }

    fn host() -> PluginHost {
        let mut catalog = Catalog::new();
        catalog.register("Echo", |_| Box::new(Echo));
        catalog.register("Counter", |_| Box::new(Counter { count: 0 }));
        PluginHost::new(catalog, Arc::new(Registry::with_core()))
    }

    #[test]
    fn load_index_and_unload() {
        let mut host = host();
        assert_eq!(host.load("echo").unwrap(), "Echo");
        assert!(matches!(host.load("Echo"), Err(PluginError::AlreadyLoaded(_))));
        assert!(matches!(host.load("Nope"), Err(PluginError::NotFound(_))));
        let index = host.index();
        assert_eq!(index.providers("ECHO").len(), 1);
        assert_eq!(index.plugin("echo").unwrap().commands, vec!["echo", "ping"]);
        assert_eq!(index.lookup("Echo", "ping").unwrap().usage(), "(ping) -- Answers pong.");
        assert_eq!(index.lookup("Echo", "echo").unwrap().usage(), "(echo <text>) -- Returns <text>.");
        assert!(host.registry.is_registered("plugins.Echo.prefix"));
        host.unload("ECHO").unwrap();
        assert!(!host.index().has_command("echo"));
        assert!(matches!(host.unload("Echo"), Err(PluginError::NotLoaded(_))));
    }

    #[test]
    fn precedence_orders_plugins_and_ambiguity_is_visible() {
        let mut host = host();
        host.load("Echo").unwrap();
        host.load("Counter").unwrap();
        assert_eq!(host.loaded(), vec!["Counter", "Echo"]);
        assert_eq!(host.index().providers("echo").len(), 2);
    }

    #[test]
    fn renames_and_disables_reshape_the_index() {
        let mut host = host();
        host.load("Echo").unwrap();
        host.rename("Echo", "ping", "pong").unwrap();
        let index = host.index();
        assert!(!index.has_command("ping"));
        assert_eq!(index.providers("pong")[0].original, "ping");
        assert!(matches!(host.rename("Echo", "echo", "pong"), Err(PluginError::RenameConflict { .. })));
        assert!(matches!(host.rename("Echo", "nope", "x"), Err(PluginError::NoSuchCommand { .. })));
        // Survives a reload through the registry.
        host.reload("Echo").unwrap();
        assert!(host.index().has_command("pong"));
        host.unrename("Echo", "pong").unwrap();
        assert!(host.index().has_command("ping"));

        host.disable("Echo.echo");
        assert!(!host.index().has_command("echo"));
        assert!(host.enable("echo.echo"));
        assert!(host.index().has_command("echo"));
    }

    #[test]
    fn reload_preserves_state() {
        let mut host = host();
        host.load("Counter").unwrap();
        let net = NetworkState::new("testnet", "perch", 10);
        host.filter_outbound(crate::msgs::privmsg("#c", "a"), &net);
        host.filter_outbound(crate::msgs::privmsg("#c", "b"), &net);
        host.reload("counter").unwrap();
        let out = host.filter_outbound(crate::msgs::privmsg("#c", "hello"), &net).unwrap();
        assert_eq!(out.params[1], "hello [filtered]");
        assert!(host.filter_outbound(crate::msgs::privmsg("#c", "a secret"), &net).is_none());
        let state = host.loaded[0].plugin.preserve().unwrap();
        assert_eq!(*state.downcast::<u32>().unwrap(), 4);
    }

    #[test]
    fn panics_are_contained() {
        let mut host = host();
        host.load("Echo").unwrap();
        let ctx = Context::in_memory(host.registry.clone(), Clock::manual(0.0));
        let net = NetworkState::new("testnet", "perch", 10);
        let index = host.index();
        let mut inv = Invocation::new(&ctx, &net, &index, None, Some(ReplyTo::new("a", "a!a@a", None)));
        let mut bogus = index.lookup("Echo", "ping").unwrap().clone();
        bogus.original = "explode".into();
        assert!(matches!(host.call(&bogus, &mut inv, vec![]), Err(CommandError::Panicked)));
        let ping = index.lookup("Echo", "ping").unwrap().clone();
        host.call(&ping, &mut inv, vec![]).unwrap();
        let (replies, _) = inv.into_parts();
        assert_eq!(replies[0].text, "pong");
    }

    #[test]
    fn manifests_alias_compiled_plugins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("greeter.toml"),
            "name = \"Greeter\"\nbase = \"Echo\"\ndescription = \"Says hi.\"\n[config]\nprefix = \">>\"\n",
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken").join("plugin.toml"), "name = \"Broken\"\nbase = \"Missing\"\n").unwrap();
        std::fs::write(dir.path().join("junk.toml"), "not = [valid").unwrap();

        let mut host = host();
        assert_eq!(host.catalog.discover(dir.path()).unwrap(), 1);
        host.load("greeter").unwrap();
        assert_eq!(host.index().plugin("Greeter").unwrap().description, "Says hi.");
        assert_eq!(host.registry.string("plugins.Greeter.prefix", None, Some("#c")), ">>");
        assert_eq!(host.index().providers("echo")[0].plugin, "Greeter");
    }

    #[test]
    fn configured_plugins_load_at_startup() {
        let mut host = host();
        host.registry.set("plugins.Counter", &Scope::global(), "True").unwrap();
        assert!(host.load_configured().is_empty());
        assert_eq!(host.loaded(), vec!["Counter"]);
    }
}

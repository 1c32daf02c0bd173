// src/runtime/packager.rs
//! Unit image packaging
//!
//! Parsers are compiled into the binary and registered by name in a
//! [`ModuleRegistry`]. Packaging a unit means selecting the prebuilt module,
//! binding it under the well-known name `Parser`, attaching a runner and
//! prepending any shared libraries. The rendered manifest text is
//! self-contained and deterministic; it identifies what a unit runs and is
//! never executed.
//!
//! ```text
//! // library: libs/draco_decoder.js     <- prepended, in listed order
//! ...
//! module ObjParser extends MeshParser { <- package_type / package_singleton
//! 	setting useIndices;
//! }
//! const Parser = ObjParser;             <- well-known binding
//! runner ParserRunner;                  <- runner + self-instantiation
//! new ParserRunner();
//! ```

use crate::runtime::fetch::{LibrarySet, ResourceFetcher};
use crate::runtime::parser::Parser;
use crate::utils::errors::{EngineError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Name every unit binds its parser under
pub const PARSER_BINDING: &str = "Parser";

/// Value of a plain configuration entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    Array(Vec<ConfigValue>),
    /// Reference to a function registered under this symbol
    Function(String),
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Render a plain configuration object as a constant declaration
pub fn package_config(name: &str, entries: &BTreeMap<String, ConfigValue>) -> String {
    let mut out = format!("const {} = {{\n", name);
    for (key, value) in entries {
        out.push_str(&format!("\t{}: {},\n", key, render_value(value)));
    }
    out.push_str("};\n");
    out
}

fn render_value(value: &ConfigValue) -> String {
    match value {
        ConfigValue::Str(s) => format!("\"{}\"", escape_str(s)),
        ConfigValue::Int(i) => i.to_string(),
        ConfigValue::Array(items) => {
            let rendered: Vec<String> = items.iter().map(render_value).collect();
            format!("[{}]", rendered.join(", "))
        }
        ConfigValue::Function(symbol) => format!("fn {}", symbol),
    }
}

fn escape_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// How a unit obtains parser instances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instancing {
    /// Fresh parser for every run
    PerRun,
    /// One parser per unit, reused across runs
    Shared,
}

/// Constructor for parser instances
pub type ParserFactory = Arc<dyn Fn() -> Box<dyn Parser> + Send + Sync>;

/// A prebuilt parser selectable by name
#[derive(Clone)]
pub struct ParserModule {
    name: String,
    base: Option<String>,
    settings: Vec<String>,
    excluded: Vec<String>,
    instancing: Instancing,
    source: Option<String>,
    factory: ParserFactory,
}

impl fmt::Debug for ParserModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserModule")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("settings", &self.settings)
            .field("excluded", &self.excluded)
            .field("instancing", &self.instancing)
            .finish()
    }
}

impl ParserModule {
    /// Create a module producing parsers with `factory`
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Parser> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            base: None,
            settings: Vec::new(),
            excluded: Vec::new(),
            instancing: Instancing::PerRun,
            source: None,
            factory: Arc::new(factory),
        }
    }

    /// Inherit settings from a named base module
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// Declare the settings this module understands
    pub fn with_settings<I, S>(mut self, settings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings = settings.into_iter().map(Into::into).collect();
        self
    }

    /// Omit settings from the packaged module; the runner skips them
    pub fn excluding<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Reuse one parser instance per unit
    pub fn shared(mut self) -> Self {
        self.instancing = Instancing::Shared;
        self
    }

    /// Pre-rendered declaration, emitted verbatim instead of the generated one
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }

    pub fn instancing(&self) -> Instancing {
        self.instancing
    }

    /// Whether the runner may apply `key` to this module's parsers
    pub fn accepts_setting(&self, key: &str) -> bool {
        !self.excluded.iter().any(|k| k == key)
    }

    /// Settings that survive the exclusion list, in declaration order
    pub fn packaged_settings(&self) -> impl Iterator<Item = &str> {
        self.settings
            .iter()
            .map(String::as_str)
            .filter(move |s| self.accepts_setting(s))
    }

    /// Create a parser instance
    pub fn instantiate(&self) -> Box<dyn Parser> {
        (self.factory)()
    }
}

/// Render a module declaration with its setting set
pub fn package_type(module: &ParserModule) -> String {
    if let Some(source) = &module.source {
        return format!("{}\n", source.trim_end());
    }

    let mut out = match &module.base {
        Some(base) => format!("module {} extends {} {{\n", module.name, base),
        None => format!("module {} {{\n", module.name),
    };
    for setting in module.packaged_settings() {
        out.push_str(&format!("\tsetting {};\n", setting));
    }
    out.push_str("}\n");
    out
}

/// Render a module declaration plus a wrapper returning one shared instance
pub fn package_singleton(module: &ParserModule) -> String {
    let mut out = package_type(module);
    out.push_str(&format!(
        "shared {name}Instance = once {name};\n",
        name = module.name
    ));
    out
}

/// Render a module according to its instancing
pub fn package_module(module: &ParserModule) -> String {
    match module.instancing {
        Instancing::PerRun => package_type(module),
        Instancing::Shared => package_singleton(module),
    }
}

/// Prebuilt parser modules keyed by name
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, ParserModule>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module, returning the one it replaced
    pub fn register(&mut self, module: ParserModule) -> Option<ParserModule> {
        debug!(module = %module.name, "Registering parser module");
        self.modules.insert(module.name.clone(), module)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Registered module names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Select a module by name, merging in the settings of its base chain
    pub fn resolve(&self, name: &str) -> Result<ParserModule> {
        let mut module = self
            .modules
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownModule(name.to_string()))?;

        let mut visited = HashSet::from([name.to_string()]);
        let mut next = module.base.clone();

        while let Some(base_name) = next {
            if !visited.insert(base_name.clone()) {
                return Err(EngineError::UnknownModule(format!(
                    "{} (inheritance cycle through {})",
                    name, base_name
                )));
            }
            let base = self
                .modules
                .get(&base_name)
                .ok_or_else(|| EngineError::UnknownModule(base_name.clone()))?;

            for setting in &base.settings {
                if !module.settings.contains(setting) {
                    module.settings.push(setting.clone());
                }
            }
            next = base.base.clone();
        }

        Ok(module)
    }
}

/// A fetched library block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryText {
    pub location: String,
    pub text: String,
}

/// Everything a unit needs before construction
#[derive(Debug, Clone)]
pub struct UnitBlueprint {
    pub module: ParserModule,
    pub parser_name: String,
    pub runner_name: String,
    pub libraries: Option<LibrarySet>,
}

/// A constructed unit: rendered manifest plus the module it runs
#[derive(Debug, Clone)]
pub struct UnitImage {
    pub manifest: String,
    pub module: ParserModule,
    pub runner_name: String,
}

/// Assemble a unit image from already fetched libraries
pub fn assemble_image(
    libraries: &[LibraryText],
    module: ParserModule,
    parser_name: &str,
    runner_name: &str,
) -> UnitImage {
    let mut manifest = String::new();

    for library in libraries {
        manifest.push_str(&format!("// library: {}\n", library.location));
        manifest.push_str(&library.text);
        if !library.text.ends_with('\n') {
            manifest.push('\n');
        }
    }

    manifest.push_str(&package_module(&module));
    manifest.push_str(&format!("const {} = {};\n", PARSER_BINDING, parser_name));
    manifest.push_str(&format!("runner {};\n", runner_name));
    manifest.push_str(&format!("new {}();\n", runner_name));

    UnitImage {
        manifest,
        module,
        runner_name: runner_name.to_string(),
    }
}

/// Fetch libraries in listed order and assemble the image.
///
/// Any fetch failure aborts construction.
pub fn build_image(blueprint: &UnitBlueprint, fetcher: &dyn ResourceFetcher) -> Result<UnitImage> {
    let mut libraries = Vec::new();

    if let Some(set) = &blueprint.libraries {
        for location in set.resolved_locations() {
            let bytes = fetcher.load(&location)?;
            debug!(location = %location, bytes = bytes.len(), "Fetched unit library");
            libraries.push(LibraryText {
                text: String::from_utf8_lossy(&bytes).into_owned(),
                location,
            });
        }
    }

    Ok(assemble_image(
        &libraries,
        blueprint.module.clone(),
        &blueprint.parser_name,
        &blueprint.runner_name,
    ))
}

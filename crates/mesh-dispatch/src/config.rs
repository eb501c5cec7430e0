use std::sync::Arc;

/// Static mutex holding the global configuration, initialized as `None`.
static MESH_GLOBAL_CONFIG: spin::Mutex<Option<Arc<GlobalConfig>>> = spin::Mutex::new(None);

/// Global configuration, covering dispatch behavior.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct GlobalConfig {
    /// Configuration of the dispatch cache.
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Settings read once when a dispatch object is created.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DispatchConfig {
    /// Route every call through the slow path, bypassing the compiled-artifact
    /// cache entirely.
    #[serde(default)]
    pub force_fallback: bool,

    /// Default value of the process-wide wide-precision mode.
    #[serde(default)]
    pub wide_precision: bool,
}

impl GlobalConfig {
    /// Retrieves the current global configuration, loading it from the current
    /// directory if not set.
    ///
    /// If no configuration is set, it attempts to load one from
    /// `meshdispatch.toml` in the current directory or its parents, then
    /// applies environment overrides. If no file is found, a default
    /// configuration is used.
    pub fn get() -> Arc<Self> {
        let mut state = MESH_GLOBAL_CONFIG.lock();
        if state.is_none() {
            let config = Self::from_current_dir().override_from_env();
            *state = Some(Arc::new(config));
        }

        state.as_ref().cloned().unwrap()
    }

    /// Sets the global configuration to the provided value.
    ///
    /// # Panics
    /// Panics if the configuration has already been set or read, as it cannot
    /// be overridden.
    pub fn set(config: Self) {
        let mut state = MESH_GLOBAL_CONFIG.lock();
        if state.is_some() {
            panic!("Cannot set the global configuration multiple times.");
        }
        *state = Some(Arc::new(config));
    }

    /// Overrides configuration fields based on environment variables.
    pub fn override_from_env(mut self) -> Self {
        if let Ok(val) = std::env::var("MESHDISPATCH_FORCE_FALLBACK") {
            match val.as_str() {
                "1" | "true" => self.dispatch.force_fallback = true,
                "0" | "false" => self.dispatch.force_fallback = false,
                _ => {}
            }
        }

        if let Ok(val) = std::env::var("MESHDISPATCH_WIDE_PRECISION") {
            match val.as_str() {
                "1" | "true" => self.dispatch.wide_precision = true,
                "0" | "false" => self.dispatch.wide_precision = false,
                _ => {}
            }
        }

        self
    }

    // Loads configuration from `meshdispatch.toml` in the current directory or
    // its parents, returning a default configuration if no file is found.
    fn from_current_dir() -> Self {
        let mut dir = match std::env::current_dir() {
            Ok(dir) => dir,
            Err(err) => {
                log::warn!("Unable to resolve the current directory. Config will be ignored ({err}).");
                return Self::default();
            }
        };

        loop {
            if let Ok(content) = Self::from_file_path(dir.join("meshdispatch.toml")) {
                return content;
            }

            if !dir.pop() {
                break;
            }
        }

        Self::default()
    }

    // Loads configuration from a specified file path.
    fn from_file_path<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = match toml::from_str(&content) {
            Ok(val) => val,
            Err(err) => panic!("The file provided doesn't have the right format => {err:?}"),
        };

        Ok(config)
    }
}

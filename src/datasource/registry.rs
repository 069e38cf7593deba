use std::collections::HashMap;
use std::fmt;

use super::{logsql, prometheus, promql, victorialogs, Datasource, DatasourceError, ParseError, ParsedExpr};

type InitFn = fn(&serde_json::Value) -> Result<Box<dyn Datasource>, DatasourceError>;
type ParseFn = fn(&str) -> Result<ParsedExpr, ParseError>;
type InjectFn = fn(&str, &[String]) -> Result<String, ParseError>;

/// Everything the engine needs to know about one plugin type
#[derive(Clone, Copy)]
pub struct DatasourceFactory {
    pub plugin_type: &'static str,
    /// Build a client from its settings object; `init_client` is still to be called
    pub init: InitFn,
    /// Parse an expression without a live client
    pub parse_expression: ParseFn,
    /// Scope an expression by `key=value` tags
    pub inject_tags: InjectFn,
}

impl fmt::Debug for DatasourceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasourceFactory")
            .field("plugin_type", &self.plugin_type)
            .finish()
    }
}

/// Immutable plugin-type to factory mapping, built once at startup
#[derive(Debug, Clone, Default)]
pub struct Registry {
    factories: HashMap<&'static str, DatasourceFactory>,
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    factories: HashMap<&'static str, DatasourceFactory>,
}

impl RegistryBuilder {
    pub fn register(mut self, factory: DatasourceFactory) -> Self {
        self.factories.insert(factory.plugin_type, factory);
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            factories: self.factories,
        }
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry with the built-in Prometheus and VictoriaLogs backends
    pub fn with_builtin() -> Registry {
        Registry::builder()
            .register(DatasourceFactory {
                plugin_type: prometheus::PLUGIN_TYPE,
                init: prometheus::Prometheus::init,
                parse_expression: promql::parse,
                inject_tags: promql::inject_labels,
            })
            .register(DatasourceFactory {
                plugin_type: victorialogs::PLUGIN_TYPE,
                init: victorialogs::VictoriaLogs::init,
                parse_expression: logsql::parse,
                inject_tags: logsql::inject_filters,
            })
            .build()
    }

    pub fn get(&self, plugin_type: &str) -> Option<&DatasourceFactory> {
        self.factories.get(plugin_type)
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn plugin_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Build and initialise a client for `plugin_type`
    pub fn init(
        &self,
        plugin_type: &str,
        settings: &serde_json::Value,
    ) -> Result<Box<dyn Datasource>, DatasourceError> {
        let factory = self.get(plugin_type).ok_or_else(|| {
            DatasourceError::Settings(format!("unknown datasource type {:?}", plugin_type))
        })?;
        let mut ds = (factory.init)(settings)?;
        ds.init_client()?;
        Ok(ds)
    }

    /// Parse an expression under the grammar of `plugin_type`
    pub fn parse_expression(&self, plugin_type: &str, expr: &str) -> Result<ParsedExpr, ParseError> {
        match self.get(plugin_type) {
            Some(factory) => (factory.parse_expression)(expr),
            None => Err(ParseError::new(
                0,
                format!("no parser registered for {:?}", plugin_type),
            )),
        }
    }
}

use crate::client::output::outputs::Output;
use crate::common::config::OrchestratorConfig;

pub struct GlobalSettings {
    config: OrchestratorConfig,
    printer: Box<dyn Output>,
}

impl GlobalSettings {
    pub fn new(config: OrchestratorConfig, printer: Box<dyn Output>) -> Self {
        GlobalSettings { config, printer }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn printer(&self) -> &dyn Output {
        self.printer.as_ref()
    }
}

//! Driver and step listing commands

use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;
use stepwise_common::{DriverDescriptor, StepDefinition};
use stepwise_runner::{RunnerConfig, Session};

use crate::output::{print_list, OutputFormat, TableDisplay};

/// Driver display wrapper for serialization
#[derive(Serialize)]
pub struct DriverDisplay {
    pub id: String,
    pub name: String,
    pub version: String,
    pub protocol: String,
    pub steps: usize,
    pub capabilities: Vec<String>,
}

impl From<&DriverDescriptor> for DriverDisplay {
    fn from(d: &DriverDescriptor) -> Self {
        Self {
            id: d.id.clone(),
            name: d.name.clone(),
            version: d.version.clone(),
            protocol: d.protocol.to_string(),
            steps: d.steps.len(),
            capabilities: d.capabilities.iter().cloned().collect(),
        }
    }
}

impl TableDisplay for DriverDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Version", "Protocol", "Steps", "Capabilities"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.version.clone(),
            self.protocol.clone(),
            self.steps.to_string(),
            self.capabilities.join(", "),
        ]
    }
}

#[derive(Serialize)]
pub struct StepDisplay {
    pub id: String,
    pub pattern: String,
    pub action: String,
    pub description: String,
}

impl From<StepDefinition> for StepDisplay {
    fn from(s: StepDefinition) -> Self {
        Self {
            id: s.id,
            pattern: s.pattern,
            action: s.action,
            description: s.description,
        }
    }
}

impl TableDisplay for StepDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Pattern", "Action", "Description"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.pattern.clone(),
            self.action.clone(),
            self.description.clone(),
        ]
    }
}

fn metadata_session(mut config: RunnerConfig, drivers: Option<PathBuf>) -> Result<Session> {
    if let Some(dir) = drivers {
        config.drivers.directory = dir;
    }
    let session = Session::new(config);
    session.initialize_registries()?;
    Ok(session)
}

/// List discovered drivers
pub fn list(config: RunnerConfig, drivers: Option<PathBuf>, format: OutputFormat) -> Result<()> {
    let session = metadata_session(config, drivers)?;
    let items: Vec<DriverDisplay> = session
        .list_driver_ids()
        .iter()
        .filter_map(|id| session.get_driver_descriptor(id).ok())
        .map(|d| DriverDisplay::from(d.as_ref()))
        .collect();
    print_list(&items, format);
    Ok(())
}

/// List the step definitions of one driver
pub fn steps(
    config: RunnerConfig,
    drivers: Option<PathBuf>,
    driver_id: &str,
    format: OutputFormat,
) -> Result<()> {
    let session = metadata_session(config, drivers)?;
    let items: Vec<StepDisplay> = session
        .get_driver_steps(driver_id)?
        .into_iter()
        .map(StepDisplay::from)
        .collect();
    print_list(&items, format);
    Ok(())
}

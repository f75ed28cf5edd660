pub mod error;
pub mod routes;

use std::sync::Arc;

use services::services::{
    commands::CommandService, container::ContainerPool, events::EventService,
};

#[derive(Clone)]
pub struct AppState {
    pool: Arc<ContainerPool>,
    commands: Arc<CommandService>,
    events: EventService,
}

impl AppState {
    pub fn new(pool: Arc<ContainerPool>, commands: Arc<CommandService>, events: EventService) -> Self {
        Self {
            pool,
            commands,
            events,
        }
    }

    pub fn pool(&self) -> &Arc<ContainerPool> {
        &self.pool
    }

    pub fn commands(&self) -> &Arc<CommandService> {
        &self.commands
    }

    pub fn events(&self) -> &EventService {
        &self.events
    }
}

pub mod background;
pub mod config;
pub mod events;

pub use background::{BackgroundSystem, MailContext};
pub use config::Settings;
pub use events::UserRegistered;

/// Build the background system from the environment and start its workers
pub async fn build() -> anyhow::Result<BackgroundSystem> {
    let settings = Settings::from_env()?;
    let mut system = BackgroundSystem::from_settings(&settings).await?;
    system.start()?;
    Ok(system)
}

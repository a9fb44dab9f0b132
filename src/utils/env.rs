use log::{debug, info};
use std::path::Path;

/// Loads `.env` from the working directory when present. Real environment
/// variables always win over file entries.
pub fn load_env() {
    let env_path = Path::new(".env");
    if env_path.exists() {
        match dotenv::from_path(env_path) {
            Ok(_) => info!("Loaded environment variables from {}", env_path.display()),
            Err(e) => debug!("Could not read {}: {}", env_path.display(), e),
        }
    } else {
        debug!("No .env file found; using process environment only");
    }
}

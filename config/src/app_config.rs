use directories::ProjectDirs;
use std::{
    env,
    path::PathBuf,
};

lazy_static::lazy_static! {
    pub static ref PROJECT_NAME: String = "DDC".to_string();
    static ref DATA_FOLDER: Option<PathBuf> = env::var(format!("{}_DATA", PROJECT_NAME.clone()))
        .ok()
        .map(PathBuf::from);
}

/// Where the driver keeps its log when no output directory is known yet.
pub fn get_data_dir() -> PathBuf {
    let directory = if let Some(s) = DATA_FOLDER.clone() {
        s
    } else if let Some(proj_dirs) = project_directory() {
        proj_dirs.data_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".data")
    };
    directory
}

fn project_directory() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "dremio", "ddc")
}

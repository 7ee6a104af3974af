use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::Result;

pub const CNI_VERSION: &str = "0.3.1";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NetConfList<'a> {
    cni_version: &'a str,
    name: &'a str,
    plugins: Vec<PluginConf<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PluginConf<'a> {
    name: &'a str,
    r#type: &'a str,
    veth_prefix: &'a str,
}

pub fn render_config(veth_prefix: &str) -> Result<Vec<u8>> {
    let conf = NetConfList {
        cni_version: CNI_VERSION,
        name: "hostnic-cni",
        plugins: vec![PluginConf {
            name: "hostnic",
            r#type: "hostnic",
            veth_prefix,
        }],
    };
    Ok(serde_json::to_vec_pretty(&conf)?)
}

/// The presence of this file tells the runtime the node is ready for
/// pods; it is written only after bootstrap succeeds and never removed
/// on shutdown.
pub fn write_config(path: &Path, veth_prefix: &str) -> Result<()> {
    info!("writing cni config to {}", path.display());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let rendered = render_config(veth_prefix)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&rendered)?;
    Ok(())
}

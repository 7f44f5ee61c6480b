//! Roomservice manifest generation.
//!
//! A roomservice manifest is a repo local manifest that pulls the device tree
//! (and the kernel tree, when known) into the flavor's source checkout.

use crate::devices::DeviceInfo;
use crate::models::RecoveryFlavor;

/// Split a git URL into the `fetch` base and the project `name` repo expects.
fn split_remote(url: &str) -> (String, String) {
    let trimmed = url.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    match trimmed.rsplit_once('/') {
        Some((base, name)) => (format!("{}/", base), name.to_string()),
        None => (String::new(), trimmed.to_string()),
    }
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Render `roomservice_{device}.xml` for the device and flavor.
pub fn render(device: &DeviceInfo, flavor: RecoveryFlavor, version: &str) -> String {
    let branch = device
        .tree
        .branch
        .clone()
        .unwrap_or_else(|| flavor.manifest_branch(version));

    let (tree_fetch, tree_name) = split_remote(&device.tree.url);

    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(&format!(
        "<!-- {} {} ({}) - {} {} -->\n",
        escape(&device.vendor),
        escape(&device.display_name),
        escape(&device.codename),
        flavor.display_name(),
        escape(version)
    ));
    xml.push_str("<manifest>\n");
    xml.push_str(&format!(
        "  <remote name=\"device-{}\" fetch=\"{}\" />\n",
        escape(&device.codename),
        escape(&tree_fetch)
    ));
    xml.push_str(&format!(
        "  <project name=\"{}\" path=\"{}\" remote=\"device-{}\" revision=\"{}\" />\n",
        escape(&tree_name),
        escape(&device.checkout_path()),
        escape(&device.codename),
        escape(&branch)
    ));

    if let Some(kernel_url) = &device.tree.kernel_url {
        let (kernel_fetch, kernel_name) = split_remote(kernel_url);
        xml.push_str(&format!(
            "  <remote name=\"kernel-{}\" fetch=\"{}\" />\n",
            escape(&device.codename),
            escape(&kernel_fetch)
        ));
        xml.push_str(&format!(
            "  <project name=\"{}\" path=\"kernel/{}/{}\" remote=\"kernel-{}\" revision=\"{}\" />\n",
            escape(&kernel_name),
            escape(&device.vendor.to_lowercase()),
            escape(&device.codename),
            escape(&device.codename),
            escape(&branch)
        ));
    }

    xml.push_str("</manifest>\n");
    xml
}

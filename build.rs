fn main() {
    // Bake the helper paths into the binary so deployments can pin them
    // without patching the source.
    println!("cargo::rerun-if-env-changed=RTAPE_RMT_COMMAND");
    println!("cargo::rerun-if-env-changed=RTAPE_REMOTE_SHELL");

    let rmt_command =
        std::env::var("RTAPE_RMT_COMMAND").unwrap_or_else(|_| "/etc/rmt".to_owned());
    println!("cargo::rustc-env=RTAPE_RMT_COMMAND={rmt_command}");

    // The remote shell has no portable default. When the build environment
    // does not name one, connections require an explicit path at run time.
    if let Ok(remote_shell) = std::env::var("RTAPE_REMOTE_SHELL") {
        println!("cargo::rustc-env=RTAPE_REMOTE_SHELL={remote_shell}");
    }
}

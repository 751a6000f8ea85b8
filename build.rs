use cfg_aliases::cfg_aliases;

fn main() {
    // Setup cfg aliases
    cfg_aliases! {
        // Platforms
        linux: { any(target_os = "linux", target_os = "android") },
        // The `caps` crate is only pulled in for Linux proper
        capabilities: { target_os = "linux" },
        // Kernel interfaces exercised by the shipped test programs
        fanotify: { target_os = "linux" },
        smaps: { linux },
    }
}

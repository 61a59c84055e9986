use std::env;

// The worker reports its build to the supervisor in the ping response, so
// a short revision id is baked into the binary here. CI provides GIT_SHA;
// local builds get a "dev" marker instead.
fn main() {
    let sha = env::var("GIT_SHA").unwrap_or_default();
    let short: String = match sha.trim() {
        "" => "dev".to_string(),
        sha => sha.chars().take(7).collect(),
    };
    println!("cargo:rustc-env=GIT_SHA={short}");
    println!("cargo:rerun-if-env-changed=GIT_SHA");
}

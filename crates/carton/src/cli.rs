use carton_core::handles::ContainerHandle;
use carton_core::store::AccessPolicy;
use colored::Colorize;

pub fn print_url(url: &str) {
    println!("{}", url.bright_purple());
}

pub fn print_containers(containers: &[ContainerHandle]) {
    if containers.is_empty() {
        println!("{}", "(no containers)".bright_black());
        return;
    }
    for container in containers {
        println!("{}", container.name().bright_white());
    }
}

pub fn print_policy(name: &str, policy: AccessPolicy) {
    println!(
        "{} {}",
        name.bright_black(),
        policy.to_string().bright_blue().bold()
    );
}

//! Version subcommand implementation

pub fn run() {
    for line in lines() {
        println!("{line}");
    }
}

fn lines() -> [String; 2] {
    [
        format!("tunnelward {}", env!("CARGO_PKG_VERSION")),
        format!(
            "target: {}-{}",
            std::env::consts::ARCH,
            std::env::consts::OS
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_only_known_facts() {
        let [name, target] = lines();
        assert_eq!(name, format!("tunnelward {}", env!("CARGO_PKG_VERSION")));
        assert!(target.ends_with(std::env::consts::OS));
        assert!(lines().iter().all(|l| !l.starts_with("rustc")));
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::process::{Command, Output};
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, contents: &str) -> anyhow::Result<()> {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Sources plus an empty config file so the user's config is not read.
    fn fixture() -> anyhow::Result<(TempDir, PathBuf)> {
        let temp = TempDir::new()?;
        let src = temp.path().join("src");
        write(&src, "app/main.x", "main")?;
        write(&src, "app/unit.toml", "imports = [\"lib\", \"C\"]")?;
        write(&src, "lib/util.x", "util")?;
        write(&src, "lib/util_test.x", "test")?;
        write(&src, "tools/gen.x", "gen")?;
        write(&src, "_scratch/skip.x", "skip")?;
        write(temp.path(), "config.toml", "")?;
        Ok((temp, src))
    }

    fn srctunnel(temp: &TempDir, args: &[&str]) -> anyhow::Result<Output> {
        let config = temp.path().join("config.toml");
        Ok(Command::new(env!("CARGO_BIN_EXE_srctunnel"))
            .arg("--config")
            .arg(&config)
            .args(args)
            .output()?)
    }

    #[test]
    fn test_units_lists_every_unit() -> anyhow::Result<()> {
        let (temp, src) = fixture()?;
        let output = srctunnel(&temp, &["units", "--root", src.to_str().unwrap()])?;

        assert!(output.status.success());
        let stdout = String::from_utf8(output.stdout)?;
        assert_eq!(stdout.lines().collect::<Vec<_>>(), vec!["app", "lib", "tools"]);
        Ok(())
    }

    #[test]
    fn test_units_json() -> anyhow::Result<()> {
        let (temp, src) = fixture()?;
        let output = srctunnel(&temp, &["units", "--json", "--root", src.to_str().unwrap()])?;

        assert!(output.status.success());
        let units: Vec<String> = serde_json::from_slice(&output.stdout)?;
        assert_eq!(units, vec!["app", "lib", "tools"]);
        Ok(())
    }

    #[test]
    fn test_closure_follows_imports() -> anyhow::Result<()> {
        let (temp, src) = fixture()?;
        let output = srctunnel(&temp, &["closure", "app", "--root", src.to_str().unwrap()])?;

        assert!(output.status.success());
        let stdout = String::from_utf8(output.stdout)?;
        assert_eq!(stdout.lines().collect::<Vec<_>>(), vec!["app", "lib"]);
        Ok(())
    }

    #[test]
    fn test_closure_json_with_tests() -> anyhow::Result<()> {
        let (temp, src) = fixture()?;
        let output = srctunnel(
            &temp,
            &["closure", "lib", "--tests", "--json", "--root", src.to_str().unwrap()],
        )?;

        assert!(output.status.success());
        let members: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let files: Vec<&str> = members[0]["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f.as_str().unwrap())
            .collect();
        assert!(files.contains(&"util.x"));
        assert!(files.contains(&"util_test.x"));
        Ok(())
    }

    #[test]
    fn test_missing_unit_fails() -> anyhow::Result<()> {
        let (temp, src) = fixture()?;
        let output = srctunnel(&temp, &["closure", "nope", "--root", src.to_str().unwrap()])?;

        assert!(!output.status.success());
        assert_eq!(output.status.code(), Some(1));
        assert!(String::from_utf8_lossy(&output.stderr).contains("nope"));
        Ok(())
    }

    #[test]
    fn test_agent_requires_relay() -> anyhow::Result<()> {
        let (temp, src) = fixture()?;
        let output = Command::new(env!("CARGO_BIN_EXE_srctunnel"))
            .arg("--config")
            .arg(temp.path().join("config.toml"))
            .args(["agent", "--root", src.to_str().unwrap()])
            .env_remove("SRCTUNNEL_RELAY")
            .output()?;

        assert!(!output.status.success());
        assert!(String::from_utf8_lossy(&output.stderr).contains("No relay address"));
        Ok(())
    }
}

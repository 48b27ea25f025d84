//! Unit-test configuration files.
//!
//! A `.conf` file lists register preconditions and postconditions for the
//! companion binary (same path, `conf` suffix swapped for `bin`):
//!
//! ```text
//! [pre]
//! r1=0x10
//! a0=32
//!
//! [post]
//! r3=0x30
//! ```

use std::path::{Path, PathBuf};

use crate::{Error, RegInit};


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestConfig {
    pub pre: Vec<RegInit>,
    pub post: Vec<RegInit>,
    pub binary: PathBuf,
}


pub fn load(path: &Path) -> Result<TestConfig, Error> {
    let binary = companion_binary(path)?;

    let text = std::fs::read_to_string(path).map_err(|source| Error::Open {
        path: path.display().to_string(),
        source,
    })?;

    let (pre, post) = parse(&text)?;

    Ok(TestConfig { pre, post, binary })
}


/// The binary under test sits next to its config: `x.conf` -> `x.bin`.
pub fn companion_binary(path: &Path) -> Result<PathBuf, Error> {
    let name = path.to_str().filter(|s| s.ends_with(".conf")).ok_or_else(|| {
        Error::BadTestConfig(format!("'{}' is not a .conf file", path.display()))
    })?;

    Ok(PathBuf::from(format!("{}bin", &name[..name.len() - 4])))
}


fn parse(text: &str) -> Result<(Vec<RegInit>, Vec<RegInit>), Error> {
    #[derive(PartialEq)]
    enum Section {
        None,
        Pre,
        Post,
    }

    let mut section = Section::None;
    let mut seen_post = false;
    let mut pre = Vec::new();
    let mut post = Vec::new();

    for (num, raw) in text.lines().enumerate() {
        let line = raw.trim();
        let num = num + 1;

        if line.is_empty() {
            continue;
        }

        match line {
            "[pre]" => {
                if section != Section::None {
                    return Err(Error::BadTestConfig(format!("line {num}: duplicate [pre]")));
                }
                section = Section::Pre;
            }

            "[post]" => {
                if section == Section::None {
                    return Err(Error::BadTestConfig(format!("line {num}: [post] before [pre]")));
                }
                if seen_post {
                    return Err(Error::BadTestConfig(format!("line {num}: duplicate [post]")));
                }
                seen_post = true;
                section = Section::Post;
            }

            other if other.starts_with('[') => {
                return Err(Error::BadTestConfig(format!("line {num}: unknown section {other}")));
            }

            init => {
                let init: RegInit = init.parse()?;
                match section {
                    Section::None => {
                        return Err(Error::BadTestConfig(format!(
                            "line {num}: initialiser before [pre]"
                        )));
                    }
                    Section::Pre => pre.push(init),
                    Section::Post => post.push(init),
                }
            }
        }
    }

    if section == Section::None {
        return Err(Error::BadTestConfig("missing [pre] section".to_string()));
    }

    Ok((pre, post))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pre_and_post() {
        let (pre, post) = parse("[pre]\nr1=0x10\nr2=0x20\n\n[post]\nr3=0x30\n").unwrap();

        assert_eq!(pre, vec![
            RegInit { reg: 1, val: 0x10 },
            RegInit { reg: 2, val: 0x20 },
        ]);
        assert_eq!(post, vec![RegInit { reg: 3, val: 0x30 }]);
    }

    #[test]
    fn post_is_optional() {
        let (pre, post) = parse("[pre]\na0=1\n").unwrap();
        assert_eq!(pre.len(), 1);
        assert!(post.is_empty());
    }

    #[test]
    fn empty_sections_are_fine() {
        let (pre, post) = parse("\n[pre]\n[post]\n\n").unwrap();
        assert!(pre.is_empty());
        assert!(post.is_empty());
    }

    #[test]
    fn content_before_pre_is_an_error() {
        assert!(parse("r1=1\n[pre]\n").is_err());
        assert!(parse("[post]\nr1=1\n").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn rejects_bad_sections() {
        assert!(parse("[pre]\n[pre]\n").is_err());
        assert!(parse("[pre]\n[post]\n[post]\n").is_err());
        assert!(parse("[pre]\n[mid]\n").is_err());
    }

    #[test]
    fn bad_initialiser_is_an_error() {
        assert!(parse("[pre]\nnonsense\n").is_err());
        assert!(parse("[pre]\nr40=1\n").is_err());
    }

    #[test]
    fn binary_path_swaps_the_suffix() {
        let bin = companion_binary(Path::new("tests/addi-01.conf")).unwrap();
        assert_eq!(bin, PathBuf::from("tests/addi-01.bin"));

        assert!(companion_binary(Path::new("tests/addi-01.cfg")).is_err());
    }
}

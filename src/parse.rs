//! Scanning C++ sources for module declarations and imports.
//!
//! This is deliberately lexical: anchored regexes over the source text, the
//! same approach the wider ecosystem uses for import discovery. It covers the
//! declarations a build system needs for ordering (`export module m;`,
//! `module m;`, `import m;`, `import :part;`) and ignores header units
//! (`import <header>;` / `import "header";`), which resolve through include
//! paths rather than BMIs.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{fs, path::Path};

/// Matches a module interface declaration: `export module name;`.
static RE_EXPORT_MODULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*export\s+module\s+(?P<name>[A-Za-z_][\w.:]*)\s*;").unwrap());

/// Matches a module implementation declaration: `module name;`. The global
/// module fragment `module;` and `module :private;` do not match.
static RE_MODULE_DECL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*module\s+(?P<name>[A-Za-z_][\w.:]*)\s*;").unwrap());

/// Matches a named import: `import name;` or `export import name;`.
static RE_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:export\s+)?import\s+(?P<name>[A-Za-z_][\w.:]*)\s*;").unwrap()
});

/// Matches a partition import: `import :part;`. Partition names resolve
/// relative to the declaring module.
static RE_IMPORT_PARTITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:export\s+)?import\s+(?P<part>:[\w.]+)\s*;").unwrap()
});

/// What a scan found out about one source file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    /// The module this file declares, if any.
    pub module_name: Option<String>,
    /// Whether the declaration is an interface unit (`export module`).
    pub is_interface: bool,
    /// Imported module names, partition imports already resolved against the
    /// declared module.
    pub imports: Vec<String>,
}

impl ModuleInfo {
    /// Whether the file participates in modules at all.
    pub fn is_module_unit(&self) -> bool {
        self.module_name.is_some() || !self.imports.is_empty()
    }
}

/// Scans source text for module declarations and imports.
pub fn scan_module_info(source: &str) -> ModuleInfo {
    let mut info = ModuleInfo::default();

    if let Some(cap) = RE_EXPORT_MODULE.captures(source) {
        info.module_name = Some(cap["name"].to_string());
        info.is_interface = true;
    } else if let Some(cap) = RE_MODULE_DECL.captures(source) {
        info.module_name = Some(cap["name"].to_string());
    }

    for cap in RE_IMPORT.captures_iter(source) {
        let name = cap["name"].to_string();
        if !info.imports.contains(&name) {
            info.imports.push(name);
        }
    }

    // `import :part;` refers to a partition of the module this file belongs
    // to; qualify it so the provider map can resolve it.
    if let Some(module) = info.module_name.clone() {
        let base = module.split(':').next().unwrap_or(&module).to_string();
        for cap in RE_IMPORT_PARTITION.captures_iter(source) {
            let qualified = format!("{base}{}", &cap["part"]);
            if !info.imports.contains(&qualified) {
                info.imports.push(qualified);
            }
        }
    }

    info
}

/// Reads and scans the file at `path`.
pub fn scan_file(path: &Path) -> Result<ModuleInfo> {
    let source = fs::read_to_string(path).map_err(|err| Error::io(err, path))?;
    Ok(scan_module_info(&source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn interface_unit() {
        let info = scan_module_info("export module math;\nexport int add(int, int);\n");
        assert_eq!(info.module_name.as_deref(), Some("math"));
        assert!(info.is_interface);
        assert!(info.imports.is_empty());
    }

    #[test]
    fn implementation_unit() {
        let info = scan_module_info("module math;\nint add(int a, int b) { return a + b; }\n");
        assert_eq!(info.module_name.as_deref(), Some("math"));
        assert!(!info.is_interface);
    }

    #[test]
    fn global_module_fragment_is_not_a_name() {
        let info = scan_module_info("module;\n#include <cstdio>\nexport module io;\n");
        assert_eq!(info.module_name.as_deref(), Some("io"));
        assert!(info.is_interface);
    }

    #[test]
    fn named_imports() {
        let source = "export module app;\nimport math;\nexport import strings;\nimport math;\n";
        let info = scan_module_info(source);
        assert_eq!(info.imports, vec!["math".to_string(), "strings".to_string()]);
    }

    #[test]
    fn header_units_are_ignored() {
        let source = "import <vector>;\nimport \"config.h\";\nimport math;\n";
        let info = scan_module_info(source);
        assert_eq!(info.imports, vec!["math".to_string()]);
    }

    #[test]
    fn partition_imports_are_qualified() {
        let source = "export module geo;\nimport :shapes;\nimport math;\n";
        let info = scan_module_info(source);
        assert_eq!(info.imports, vec!["math".to_string(), "geo:shapes".to_string()]);
    }

    #[test]
    fn partition_interface_declaration() {
        let info = scan_module_info("export module geo:shapes;\n");
        assert_eq!(info.module_name.as_deref(), Some("geo:shapes"));
        assert!(info.is_interface);
    }

    #[test]
    fn plain_translation_unit() {
        let info = scan_module_info("#include <stdio.h>\nint main() { return 0; }\n");
        assert_eq!(info, ModuleInfo::default());
        assert!(!info.is_module_unit());
    }

    #[test]
    fn dotted_module_names() {
        let info = scan_module_info("export module company.project.core;\n");
        assert_eq!(info.module_name.as_deref(), Some("company.project.core"));
    }

    #[test]
    fn scan_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.cppm");
        std::fs::write(&path, "export module m;\nimport dep;\n").unwrap();
        let info = scan_file(&path).unwrap();
        assert_eq!(info.module_name.as_deref(), Some("m"));
        assert_eq!(info.imports, vec!["dep".to_string()]);
    }
}

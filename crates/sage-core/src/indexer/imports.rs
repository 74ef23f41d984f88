//! Import classification and per-file name bindings.
//!
//! A module is local when one of the parser's candidate locations exists in
//! the repository; everything else is external. Bindings map the names an
//! import introduces to the module (and member) they stand for.

use std::collections::{HashMap, HashSet};

use crate::indexer::chunks::join_qualified;
use crate::indexer::parser::{RawImport, SyntaxParser};
use crate::models::ImportRecord;
use crate::store::database::NewImport;

const WILDCARD: &str = "*";

/// Repository paths used to decide whether a module is local.
#[derive(Debug, Clone, Default)]
pub struct ModuleIndex {
    files: HashSet<String>,
    dirs: HashSet<String>,
}

/// A local module: the file or package directory it lives at and its dotted
/// name within the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    pub path: String,
    pub qualified_name: String,
}

impl ModuleIndex {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut index = Self::default();
        for path in paths {
            index.insert(path.into());
        }
        index
    }

    pub fn insert(&mut self, path: String) {
        let mut dir = path.as_str();
        while let Some((parent, _)) = dir.rsplit_once('/') {
            self.dirs.insert(parent.to_string());
            dir = parent;
        }
        self.dirs.insert(String::new());
        self.files.insert(path);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// First candidate location of `module` (as written in `source_path`)
    /// that exists in the repository.
    pub fn resolve(
        &self,
        parser: &dyn SyntaxParser,
        source_path: &str,
        module: &str,
    ) -> Option<ResolvedModule> {
        parser
            .module_candidates(source_path, module)
            .into_iter()
            .find(|c| {
                if c.is_dir {
                    self.dirs.contains(&c.path)
                } else {
                    self.files.contains(&c.path)
                }
            })
            .map(|c| ResolvedModule {
                qualified_name: parser.module_name(&c.path),
                path: c.path,
            })
    }
}

/// An import with its local/external classification and, when local, the
/// module it resolved to.
#[derive(Debug, Clone)]
pub struct ClassifiedImport {
    pub record: NewImport,
    pub module: Option<ResolvedModule>,
}

pub fn classify_imports(
    parser: &dyn SyntaxParser,
    source_path: &str,
    imports: &[RawImport],
    modules: &ModuleIndex,
) -> Vec<ClassifiedImport> {
    imports
        .iter()
        .map(|raw| {
            let module = modules.resolve(parser, source_path, &raw.module);
            ClassifiedImport {
                record: NewImport {
                    module_name: raw.module.clone(),
                    module_alias: raw.module_alias.clone(),
                    imported_names: raw.names.clone(),
                    is_local: module.is_some(),
                    line: raw.line,
                },
                module,
            }
        })
        .collect()
}

/// Rebuild a classified import from a stored row. The stored classification
/// is kept; the module location is looked up again.
pub fn classify_stored(
    parser: &dyn SyntaxParser,
    source_path: &str,
    record: &ImportRecord,
    modules: &ModuleIndex,
) -> ClassifiedImport {
    let module = if record.is_local {
        modules.resolve(parser, source_path, &record.module_name)
    } else {
        None
    };
    ClassifiedImport {
        record: NewImport {
            module_name: record.module_name.clone(),
            module_alias: record.module_alias.clone(),
            imported_names: record.imported_names.clone(),
            is_local: record.is_local,
            line: record.line,
        },
        module,
    }
}

/// What a bound name refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportBinding {
    pub module: String,
    /// Imported member, `None` when the name binds the module itself.
    pub member: Option<String>,
    pub is_local: bool,
    /// Dotted name of the local module.
    pub module_qualified_name: Option<String>,
}

impl ImportBinding {
    /// Qualified name the bound name plus `rest` denotes, for local imports.
    pub fn target(&self, rest: &str) -> Option<String> {
        let module = self.module_qualified_name.as_deref()?;
        let base = join_qualified(module, self.member.as_deref().unwrap_or(""));
        Some(join_qualified(&base, rest))
    }
}

/// Names bound by one file's imports.
#[derive(Debug, Clone, Default)]
pub struct ImportBindings {
    names: HashMap<String, ImportBinding>,
    /// Dotted names of local modules imported with `*`.
    wildcards: Vec<String>,
}

impl ImportBindings {
    pub fn build(imports: &[ClassifiedImport]) -> Self {
        let mut bindings = Self::default();
        for import in imports {
            let record = &import.record;
            let module_qn = import.module.as_ref().map(|m| m.qualified_name.clone());
            let binding = |member: Option<&str>| ImportBinding {
                module: record.module_name.clone(),
                member: member.map(str::to_string),
                is_local: record.is_local,
                module_qualified_name: module_qn.clone(),
            };

            if record.imported_names.is_empty() {
                match record.module_alias.as_deref() {
                    Some(alias) => bindings.bind(alias, binding(None)),
                    None => {
                        bindings.bind(&record.module_name, binding(None));
                        // `import a.b` also makes the top-level package visible.
                        if let Some((head, _)) = record.module_name.split_once('.') {
                            if !bindings.names.contains_key(head) {
                                bindings.names.insert(
                                    head.to_string(),
                                    ImportBinding {
                                        module: head.to_string(),
                                        member: None,
                                        is_local: record.is_local,
                                        module_qualified_name: None,
                                    },
                                );
                            }
                        }
                    }
                }
                continue;
            }

            for imported in &record.imported_names {
                if imported.name == WILDCARD {
                    if let Some(qn) = &module_qn {
                        bindings.wildcards.push(qn.clone());
                    }
                    continue;
                }
                bindings.bind(imported.bound_name(), binding(Some(imported.name.as_str())));
            }
        }
        bindings
    }

    fn bind(&mut self, name: &str, binding: ImportBinding) {
        // Later imports shadow earlier ones.
        self.names.insert(name.to_string(), binding);
    }

    /// Binding for the longest dotted prefix of `callee`, with the remainder.
    pub fn lookup<'a>(&self, callee: &'a str) -> Option<(&ImportBinding, &'a str)> {
        let mut end = callee.len();
        loop {
            let prefix = &callee[..end];
            if let Some(binding) = self.names.get(prefix) {
                let rest = callee[end..].trim_start_matches('.');
                return Some((binding, rest));
            }
            end = prefix.rfind('.')?;
        }
    }

    pub fn wildcard_modules(&self) -> &[String] {
        &self.wildcards
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.wildcards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::parser::PythonParser;
    use crate::models::ImportedName;

    fn raw(module: &str, alias: Option<&str>, names: &[(&str, Option<&str>)]) -> RawImport {
        RawImport {
            module: module.to_string(),
            module_alias: alias.map(str::to_string),
            names: names.iter().map(|(n, a)| ImportedName::new(n, *a)).collect(),
            line: 1,
        }
    }

    fn index() -> ModuleIndex {
        ModuleIndex::new([
            "app/main.py",
            "app/util.py",
            "app/models/__init__.py",
            "app/models/user.py",
            "lib/ns/tool.py",
            "src/core/engine.py",
        ])
    }

    #[test]
    fn test_module_index_directories() {
        let idx = index();
        assert_eq!(idx.len(), 6);
        assert!(idx.files.contains("app/util.py"));
        assert!(idx.dirs.contains("lib/ns"));
        assert!(idx.dirs.contains("lib"));
        assert!(idx.dirs.contains(""));
        assert!(ModuleIndex::default().is_empty());
    }

    #[test]
    fn test_resolve_local_and_external() {
        let idx = index();
        let parser = PythonParser;
        let util = idx.resolve(&parser, "app/main.py", "app.util").unwrap();
        assert_eq!(util.path, "app/util.py");
        assert_eq!(util.qualified_name, "app.util");

        let pkg = idx.resolve(&parser, "app/main.py", "app.models").unwrap();
        assert_eq!(pkg.path, "app/models/__init__.py");
        assert_eq!(pkg.qualified_name, "app.models");

        let rel = idx.resolve(&parser, "app/main.py", ".util").unwrap();
        assert_eq!(rel.qualified_name, "app.util");

        let ns = idx.resolve(&parser, "app/main.py", "lib.ns").unwrap();
        assert_eq!(ns.path, "lib/ns");
        assert_eq!(ns.qualified_name, "lib.ns");

        let src = idx.resolve(&parser, "app/main.py", "core.engine").unwrap();
        assert_eq!(src.qualified_name, "src.core.engine");

        assert!(idx.resolve(&parser, "app/main.py", "numpy").is_none());
        assert!(idx.resolve(&parser, "app/main.py", "os.path").is_none());
    }

    #[test]
    fn test_classify_imports() {
        let idx = index();
        let imports = vec![
            raw("app.util", None, &[("helper", None)]),
            raw("numpy", Some("np"), &[]),
        ];
        let classified = classify_imports(&PythonParser, "app/main.py", &imports, &idx);
        assert!(classified[0].record.is_local);
        assert_eq!(classified[0].module.as_ref().unwrap().qualified_name, "app.util");
        assert!(!classified[1].record.is_local);
        assert!(classified[1].module.is_none());
        assert_eq!(classified[1].record.module_alias.as_deref(), Some("np"));
    }

    #[test]
    fn test_classify_stored_keeps_recorded_classification() {
        let idx = index();
        let record = ImportRecord {
            id: 1,
            file_id: 1,
            module_name: "app.util".to_string(),
            module_alias: None,
            imported_names: vec![ImportedName::new("helper", None)],
            is_local: false,
            line: 3,
        };
        let classified = classify_stored(&PythonParser, "app/main.py", &record, &idx);
        assert!(!classified.record.is_local);
        assert!(classified.module.is_none());

        let record = ImportRecord {
            is_local: true,
            ..record
        };
        let classified = classify_stored(&PythonParser, "app/main.py", &record, &idx);
        assert_eq!(classified.module.unwrap().qualified_name, "app.util");
    }

    #[test]
    fn test_bindings_and_lookup() {
        let idx = index();
        let imports = vec![
            raw("app.util", None, &[("helper", Some("h")), ("run", None)]),
            raw("app.models", None, &[]),
            raw("numpy", Some("np"), &[]),
            raw("os.path", None, &[]),
            raw("app.models.user", None, &[("*", None)]),
        ];
        let classified = classify_imports(&PythonParser, "app/main.py", &imports, &idx);
        let bindings = ImportBindings::build(&classified);

        let (b, rest) = bindings.lookup("h").unwrap();
        assert_eq!(b.member.as_deref(), Some("helper"));
        assert_eq!(rest, "");
        assert_eq!(b.target(rest).as_deref(), Some("app.util.helper"));

        let (b, rest) = bindings.lookup("app.models.User.create").unwrap();
        assert_eq!(b.module, "app.models");
        assert_eq!(rest, "User.create");
        assert_eq!(b.target(rest).as_deref(), Some("app.models.User.create"));

        let (b, rest) = bindings.lookup("np.linalg.norm").unwrap();
        assert!(!b.is_local);
        assert_eq!(rest, "linalg.norm");
        assert!(b.target(rest).is_none());

        let (b, _) = bindings.lookup("os.getcwd").unwrap();
        assert_eq!(b.module, "os");
        assert!(!b.is_local);

        assert!(bindings.lookup("helper").is_none());
        assert!(bindings.lookup("ghost").is_none());
        assert_eq!(bindings.wildcard_modules(), ["app.models.user".to_string()]);
        assert!(!bindings.is_empty());
    }

    #[test]
    fn test_external_wildcard_binds_nothing() {
        let idx = index();
        let imports = vec![raw("tkinter", None, &[("*", None)])];
        let classified = classify_imports(&PythonParser, "app/main.py", &imports, &idx);
        let bindings = ImportBindings::build(&classified);
        assert!(bindings.is_empty());
    }
}

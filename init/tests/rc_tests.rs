//! Tests for rc-file parsing against real files: imports, substitution,
//! cycles and cross-file diagnostics.

use std::path::PathBuf;
use sysboot_init::properties::PropertyStore;
use sysboot_init::rc::{Parser, TriggerCondition};
use sysboot_init::Error;
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}

mod imports {
    use super::*;

    #[test]
    fn import_path_expands_against_the_store_at_parse_time() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "hw_pi.rc",
            "on hardware-ready\n    setprop hw.kind pi\n",
        );
        let main = write(
            &dir,
            "main.rc",
            &format!("import {}/hw_${{ro.hw}}.rc\n", dir.path().display()),
        );

        let props = PropertyStore::new();
        props.set("ro.hw", "pi").unwrap();

        let mut parser = Parser::new(&props);
        parser.parse_file(&main).unwrap();

        assert_eq!(parser.triggers.len(), 1);
        assert_eq!(
            parser.triggers[0].conditions,
            vec![TriggerCondition::Event("hardware-ready".into())]
        );
    }

    #[test]
    fn missing_import_warns_and_parsing_continues() {
        let dir = TempDir::new().unwrap();
        let main = write(
            &dir,
            "main.rc",
            &format!(
                "import {}/hw_absent.rc\non boot\n    setprop after.import yes\n",
                dir.path().display()
            ),
        );

        let props = PropertyStore::new();
        let mut parser = Parser::new(&props);
        parser.parse_file(&main).unwrap();

        // The rest of the file still parsed.
        assert_eq!(parser.triggers.len(), 1);
    }

    #[test]
    fn self_import_is_rejected_without_recursing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cycle.rc");
        std::fs::write(
            &path,
            format!("import {}\non boot\n    setprop ok 1\n", path.display()),
        )
        .unwrap();

        let props = PropertyStore::new();
        let mut parser = Parser::new(&props);
        // Terminates, and the file's own content survives exactly once.
        parser.parse_file(&path).unwrap();
        assert_eq!(parser.triggers.len(), 1);
    }

    #[test]
    fn mutual_import_cycle_is_rejected() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.rc");
        let b = dir.path().join("b.rc");
        std::fs::write(
            &a,
            format!("import {}\non from-a\n    setprop a 1\n", b.display()),
        )
        .unwrap();
        std::fs::write(
            &b,
            format!("import {}\non from-b\n    setprop b 1\n", a.display()),
        )
        .unwrap();

        let props = PropertyStore::new();
        let mut parser = Parser::new(&props);
        parser.parse_file(&a).unwrap();

        // b's import of a was rejected; both files parsed once.
        assert_eq!(parser.triggers.len(), 2);
    }
}

mod diagnostics {
    use super::*;

    #[test]
    fn duplicate_service_across_files_aborts_the_second_file() {
        let dir = TempDir::new().unwrap();
        let first = write(&dir, "one.rc", "service svc /bin/true\n");
        let second = write(
            &dir,
            "two.rc",
            "service svc /bin/false\non boot\n    setprop x 1\n",
        );

        let props = PropertyStore::new();
        let mut parser = Parser::new(&props);
        parser.parse_file(&first).unwrap();

        let err = parser.parse_file(&second).unwrap_err();
        assert!(matches!(err, Error::DuplicateService { ref name, .. } if name == "svc"));

        // The first definition survives.
        assert_eq!(parser.services.len(), 1);
        assert_eq!(parser.services[0].exec, PathBuf::from("/bin/true"));
    }

    #[test]
    fn parse_dir_skips_broken_files_and_non_rc_entries() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.rc", "on boot\n    setprop a 1\n");
        write(&dir, "b.rc", "service dup /bin/true\nservice dup /bin/true\n");
        write(&dir, "notes.txt", "not a config file\n");

        let props = PropertyStore::new();
        let mut parser = Parser::new(&props);
        let parsed = parser.parse_dir(dir.path());

        // a.rc parsed, b.rc aborted on the duplicate, notes.txt ignored.
        assert_eq!(parsed, 1);
        assert_eq!(parser.triggers.len(), 1);
        assert_eq!(parser.services.len(), 1);
    }

    #[test]
    fn parse_dir_of_missing_directory_is_a_no_op() {
        let props = PropertyStore::new();
        let mut parser = Parser::new(&props);
        assert_eq!(parser.parse_dir(std::path::Path::new("/no/such/dir")), 0);
    }
}

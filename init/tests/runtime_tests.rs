//! End-to-end tests for the second-stage runtime: bootstrap sequencing,
//! event ordering, property-conditioned triggers and substitution timing.
//!
//! Each test stages a filesystem tree in a temp directory and drives the
//! runtime with `step`/`run_until_idle` instead of the signal loop.

use std::path::Path;
use sysboot_init::{create_test_init, Dispatch, Init};
use tempfile::TempDir;

fn stage(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

async fn booted(root: &TempDir) -> Init {
    let mut init = create_test_init(root.path().to_path_buf()).unwrap();
    init.bootstrap().await.unwrap();
    init
}

mod events {
    use super::*;

    #[tokio::test]
    async fn boot_events_run_in_documented_order() {
        let root = TempDir::new().unwrap();
        stage(
            root.path(),
            "etc/init/stages.rc",
            "on early-init\n    setprop stage.1 done\n\
             on init\n    setprop stage.2 done\n\
             on boot\n    setprop stage.3 done\n",
        );

        let mut init = booted(&root).await;

        // Stages complete strictly in queue order.
        assert_eq!(init.step().await, Dispatch::Dispatched);
        assert_eq!(init.properties().get("stage.1", ""), "done");
        assert_eq!(init.properties().get("stage.2", ""), "");

        assert_eq!(init.step().await, Dispatch::Dispatched);
        assert_eq!(init.properties().get("stage.2", ""), "done");
        assert_eq!(init.properties().get("stage.3", ""), "");

        assert_eq!(init.step().await, Dispatch::Dispatched);
        assert_eq!(init.properties().get("stage.3", ""), "done");

        init.run_until_idle().await;

        let stages: Vec<_> = init
            .properties()
            .snapshot()
            .into_iter()
            .filter(|(k, _)| k.starts_with("stage."))
            .collect();
        assert_eq!(stages.len(), 3);
    }

    #[tokio::test]
    async fn init_completed_flips_after_the_boot_events() {
        let root = TempDir::new().unwrap();
        stage(
            root.path(),
            "etc/init/check.rc",
            "on boot\n    setprop at.boot ${init.completed}\n",
        );

        let mut init = booted(&root).await;
        init.run_until_idle().await;

        // During the boot action the flag was still false.
        assert_eq!(init.properties().get("at.boot", ""), "false");
        assert_eq!(init.properties().get("init.completed", ""), "true");
    }

    #[tokio::test]
    async fn trigger_verb_enqueues_at_the_tail() {
        let root = TempDir::new().unwrap();
        stage(
            root.path(),
            "etc/init/cascade.rc",
            "on boot\n    trigger custom\n    setprop order.first boot\n\
             on custom\n    setprop order.second custom\n",
        );

        let mut init = booted(&root).await;
        init.run_until_idle().await;

        // The current action finished before the cascaded one ran.
        assert_eq!(init.properties().get("order.first", ""), "boot");
        assert_eq!(init.properties().get("order.second", ""), "custom");
    }
}

mod property_triggers {
    use super::*;

    #[tokio::test]
    async fn setprop_fires_a_property_conditioned_block() {
        let root = TempDir::new().unwrap();
        stage(
            root.path(),
            "etc/init/echo.rc",
            "on property:sys.test=ready\n    setprop sys.echoed yes\n",
        );

        let mut init = booted(&root).await;
        init.run_until_idle().await;
        assert_eq!(init.properties().get("sys.echoed", ""), "");

        init.properties().set("sys.test", "ready").unwrap();
        assert_eq!(init.step().await, Dispatch::Dispatched);
        assert_eq!(init.properties().get("sys.echoed", ""), "yes");
    }

    #[tokio::test]
    async fn non_matching_value_does_not_fire() {
        let root = TempDir::new().unwrap();
        stage(
            root.path(),
            "etc/init/echo.rc",
            "on property:sys.test=ready\n    setprop sys.echoed yes\n",
        );

        let mut init = booted(&root).await;
        init.run_until_idle().await;

        init.properties().set("sys.test", "almost").unwrap();
        assert_eq!(init.step().await, Dispatch::Idle);
        assert_eq!(init.properties().get("sys.echoed", ""), "");
    }

    #[tokio::test]
    async fn substitution_uses_the_value_at_execution_time() {
        let root = TempDir::new().unwrap();
        // late-init runs before boot, so by the time the boot block
        // executes the source property has its late value.
        stage(
            root.path(),
            "etc/init/subst.rc",
            "on late-init\n    setprop sys.src late-value\n\
             on boot\n    setprop sys.copy ${sys.src}\n",
        );

        let mut init = booted(&root).await;
        init.run_until_idle().await;

        assert_eq!(init.properties().get("sys.copy", ""), "late-value");
    }

    #[tokio::test]
    async fn setprop_cascade_runs_after_the_current_action() {
        let root = TempDir::new().unwrap();
        stage(
            root.path(),
            "etc/init/chain.rc",
            "on boot\n    setprop chain.a on\n    setprop chain.done yes\n\
             on property:chain.a=on\n    setprop chain.b ${chain.done}\n",
        );

        let mut init = booted(&root).await;
        init.run_until_idle().await;

        // The property block ran after the whole boot action, so it saw
        // the later setprop of the same block.
        assert_eq!(init.properties().get("chain.b", ""), "yes");
    }
}

mod bootstrap {
    use super::*;

    #[tokio::test]
    async fn defaults_policy_and_probes_are_published() {
        let root = TempDir::new().unwrap();
        stage(root.path(), "etc/prop.default", "ro.product=widget\n");
        stage(
            root.path(),
            "usr/share/etc/prop.default",
            "ro.vendor.tier=dev\n",
        );
        stage(
            root.path(),
            "etc/selinux/config",
            "SELINUX=enforcing\nSELINUXTYPE=targeted\n",
        );
        stage(
            root.path(),
            "etc/selinux/targeted/file_contexts",
            "/bin/.* system_u:object_r:bin_t\n",
        );
        std::fs::create_dir_all(root.path().join("home/alice")).unwrap();

        let mut init = booted(&root).await;
        init.run_until_idle().await;

        let props = init.properties();
        assert_eq!(props.get("ro.product", ""), "widget");
        assert_eq!(props.get("ro.vendor.tier", ""), "dev");
        assert_eq!(props.get("ro.boot.selinux", ""), "enforcing");
        assert_eq!(props.get("ro.boot.selinux_type", ""), "targeted");
        assert_eq!(props.get("ro.boot.user", ""), "alice");
        assert_eq!(props.get("ro.boot.mode", ""), "normal");
        assert_eq!(props.get("ro.boot.gpu", ""), "none");
        assert!(init.security().unwrap().is_enforcing());
    }

    #[tokio::test]
    async fn cmdline_flags_seed_the_ro_boot_namespace() {
        let root = TempDir::new().unwrap();
        stage(root.path(), "proc/cmdline", "sysboot.mode=charger sysboot.debug=1\n");

        let mut init = booted(&root).await;
        init.run_until_idle().await;

        assert_eq!(init.properties().get("ro.boot.mode", ""), "charger");
        assert_eq!(init.properties().get("ro.boot.debug", ""), "1");
    }

    #[tokio::test]
    async fn persistent_properties_survive_a_runtime_restart() {
        let root = TempDir::new().unwrap();

        {
            let mut init = booted(&root).await;
            init.run_until_idle().await;
            init.properties().set("persist.counter", "42").unwrap();
        }

        let mut init = booted(&root).await;
        init.run_until_idle().await;
        assert_eq!(init.properties().get("persist.counter", ""), "42");
    }

    #[tokio::test]
    async fn uevent_rules_are_applied_to_staged_nodes() {
        use std::os::unix::fs::PermissionsExt;

        let root = TempDir::new().unwrap();
        stage(root.path(), "etc/ueventd.rc", "/dev/block/sda* 0660 root root\n");
        stage(root.path(), "dev/block/sda1", "");

        let mut init = booted(&root).await;
        init.run_until_idle().await;

        let mode = std::fs::metadata(root.path().join("dev/block/sda1"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o660);
        assert_eq!(init.uevent_rules().device_rules.len(), 1);
    }

    #[tokio::test]
    async fn write_and_mkdir_commands_stay_inside_the_root() {
        let root = TempDir::new().unwrap();
        stage(
            root.path(),
            "etc/init/fs.rc",
            "on boot\n    mkdir /run/sysboot 0755\n    write /run/sysboot/ready \"boot done\"\n",
        );

        let mut init = booted(&root).await;
        init.run_until_idle().await;

        let content = std::fs::read_to_string(root.path().join("run/sysboot/ready")).unwrap();
        assert_eq!(content, "boot done");
    }
}

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use ovnstack::ovnstack::cni::install::{find_in_path, install_plugin};
use ovnstack::ovnstack::ipam::Cidr;
use ovnstack::ovnstack::test_support::overlay_config_in;
use serial_test::serial;
use tempfile::TempDir;

struct EnvGuard {
    key: &'static str,
    previous: Option<String>,
}

impl EnvGuard {
    fn set<K: Into<String>>(key: &'static str, value: K) -> Self {
        let previous = env::var(key).ok();
        env::set_var(key, value.into());
        Self { key, previous }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.previous.as_ref() {
            env::set_var(self.key, prev);
        } else {
            env::remove_var(self.key);
        }
    }
}

fn write_script(path: &Path) {
    fs::write(path, "#!/bin/sh\nexit 0\n").expect("failed to write script");
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("set permissions");
}

#[test]
#[serial]
fn install_links_the_plugin_and_writes_the_conf_once() {
    let temp = TempDir::new().expect("tempdir");
    let path_dir = temp.path().join("usr/bin");
    fs::create_dir_all(&path_dir).unwrap();
    write_script(&path_dir.join("ovn-cni"));
    let _path = EnvGuard::set("PATH", path_dir.to_string_lossy());

    let config = overlay_config_in(temp.path());
    let subnet = Cidr::parse("10.1.1.0/24").unwrap();
    let first = install_plugin(&config, &subnet).expect("install");

    assert!(first.link_created);
    assert!(first.conf_written);
    assert_eq!(first.link, temp.path().join("opt/cni/bin/ovn_cni"));
    assert_eq!(fs::read_link(&first.link).unwrap(), path_dir.join("ovn-cni"));

    let conf: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&first.conf).unwrap()).unwrap();
    assert_eq!(first.conf, temp.path().join("etc/cni/net.d/10-net.conf"));
    assert_eq!(conf["type"], "ovn_cni");
    assert_eq!(conf["bridge"], "br-int");
    assert_eq!(conf["isGateway"], true);
    assert_eq!(conf["ipMasq"], false);
    assert_eq!(conf["ipam"]["type"], "host-local");
    assert_eq!(conf["ipam"]["subnet"], "10.1.1.0/24");

    fs::write(&first.conf, "{\"edited\": true}").unwrap();
    let second = install_plugin(&config, &subnet).expect("reinstall");
    assert!(!second.link_created);
    assert!(!second.conf_written);
    assert_eq!(fs::read_to_string(&second.conf).unwrap(), "{\"edited\": true}");
}

#[test]
#[serial]
fn missing_plugin_executable_is_a_config_error() {
    let temp = TempDir::new().expect("tempdir");
    let empty = temp.path().join("empty");
    fs::create_dir_all(&empty).unwrap();
    let _path = EnvGuard::set("PATH", empty.to_string_lossy());

    assert_eq!(find_in_path("ovn-cni"), None);
    let err = install_plugin(
        &overlay_config_in(temp.path()),
        &Cidr::parse("10.1.1.0/24").unwrap(),
    )
    .expect_err("no executable");
    assert_eq!(err.kind(), "config");
    assert!(!temp.path().join("etc/cni/net.d/10-net.conf").exists());
}

#[test]
#[serial]
fn non_executable_files_are_skipped() {
    let temp = TempDir::new().expect("tempdir");
    let first = temp.path().join("first");
    let second = temp.path().join("second");
    fs::create_dir_all(&first).unwrap();
    fs::create_dir_all(&second).unwrap();
    fs::write(first.join("ovn-cni"), "not executable").unwrap();
    write_script(&second.join("ovn-cni"));
    let _path = EnvGuard::set(
        "PATH",
        format!("{}:{}", first.display(), second.display()),
    );

    assert_eq!(find_in_path("ovn-cni"), Some(second.join("ovn-cni")));
}

pub mod firewall;
pub mod idmap;
pub mod launcher;
pub mod mounts;
pub mod namespaces;
pub mod netlink;
pub mod netns;
pub mod privileges;

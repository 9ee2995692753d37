use super::Group;
use serde::{Deserialize, Serialize};

/// The identity a process runs with at a point in time.
///
/// A run moves through at most one identity change: from the elevated
/// identity the tool was started with to the unprivileged target identity
/// the collection worker continues under.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    /// Primary group name.
    pub group: String,
    /// Supplementary groups, including the primary group.
    pub groups: Vec<Group>,
    /// Home directory, used as working directory after switching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
}

impl Identity {
    /// Whether this identity holds superuser privilege.
    pub fn is_privileged(&self) -> bool {
        self.uid == 0
    }

    /// Numeric ids of all groups the identity belongs to.
    pub fn group_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.groups.iter().map(|g| g.id).collect();
        if !ids.contains(&self.gid) {
            ids.push(self.gid);
        }
        ids
    }

    /// Comma separated group names, as written to the run metadata.
    pub fn group_names(&self) -> String {
        self.groups
            .iter()
            .map(|g| g.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(uid={}, gid={}/{})",
            self.username, self.uid, self.gid, self.group
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle() -> Identity {
        Identity {
            uid: 54321,
            gid: 54321,
            username: "oracle".to_string(),
            group: "oinstall".to_string(),
            groups: vec![Group::new(54322, "dba")],
            home: Some("/home/oracle".to_string()),
        }
    }

    #[test]
    fn test_group_ids_include_primary() {
        let ids = oracle().group_ids();
        assert_eq!(ids, vec![54322, 54321]);
    }

    #[test]
    fn test_is_privileged() {
        assert!(!oracle().is_privileged());
        let mut root = oracle();
        root.uid = 0;
        assert!(root.is_privileged());
    }

    #[test]
    fn test_display() {
        assert_eq!(oracle().to_string(), "oracle(uid=54321, gid=54321/oinstall)");
    }
}

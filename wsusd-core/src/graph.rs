//! Prerequisite graph
//!
//! Partitions the current-revision corpus into roots, non-leafs, and leaves,
//! and answers applicability and category-scope queries for the sync layer.
//!
//! Classification:
//! - root: no prerequisites at all
//! - non-leaf: some other update depends on it
//! - leaf: has prerequisites and nothing depends on it
//!
//! The classes are pairwise disjoint and cover the corpus.

use crate::package::{Package, PackageKind, PrereqClause};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Derived graph over the current revision of every known GUID.
#[derive(Debug, Default)]
pub struct PrerequisiteGraph {
    roots: HashSet<Uuid>,
    non_leafs: HashSet<Uuid>,
    leaves: HashSet<Uuid>,
    software_leaf_guids: HashSet<Uuid>,
    /// Prerequisite clauses per known GUID.
    prereqs: HashMap<Uuid, Vec<PrereqClause>>,
}

impl PrerequisiteGraph {
    /// Build the graph in a single pass over the current-revision packages.
    pub fn build(packages: &[Package]) -> Self {
        let mut prereqs: HashMap<Uuid, Vec<PrereqClause>> = HashMap::new();
        let mut kinds: HashMap<Uuid, PackageKind> = HashMap::new();
        let mut dependents: HashMap<Uuid, usize> = HashMap::new();

        for pkg in packages {
            kinds.insert(pkg.identity.guid, pkg.kind);
            prereqs.insert(pkg.identity.guid, pkg.prerequisites.clone());
            for clause in &pkg.prerequisites {
                for guid in clause.referenced() {
                    *dependents.entry(guid).or_default() += 1;
                }
            }
        }

        let mut roots = HashSet::new();
        let mut non_leafs = HashSet::new();
        let mut leaves = HashSet::new();
        let mut software_leaf_guids = HashSet::new();

        for (guid, clauses) in &prereqs {
            if clauses.is_empty() {
                roots.insert(*guid);
            } else if dependents.get(guid).copied().unwrap_or(0) > 0 {
                non_leafs.insert(*guid);
            } else {
                leaves.insert(*guid);
                if kinds
                    .get(guid)
                    .map(|k| k.is_software_or_driver())
                    .unwrap_or(false)
                {
                    software_leaf_guids.insert(*guid);
                }
            }
        }

        Self {
            roots,
            non_leafs,
            leaves,
            software_leaf_guids,
            prereqs,
        }
    }

    pub fn roots(&self) -> &HashSet<Uuid> {
        &self.roots
    }

    pub fn non_leafs(&self) -> &HashSet<Uuid> {
        &self.non_leafs
    }

    pub fn leaves(&self) -> &HashSet<Uuid> {
        &self.leaves
    }

    pub fn software_leaf_guids(&self) -> &HashSet<Uuid> {
        &self.software_leaf_guids
    }

    pub fn contains(&self, guid: &Uuid) -> bool {
        self.prereqs.contains_key(guid)
    }

    /// Whether `guid`'s prerequisite expression holds against the client's
    /// installed non-leaf set.
    ///
    /// Category clauses are satisfied unconditionally here, whether or not
    /// their GUIDs resolve; they scope results through `matches_categories`
    /// instead. An install prerequisite referencing a GUID the corpus does
    /// not know renders the update not applicable.
    pub fn is_applicable(&self, guid: &Uuid, installed: &HashSet<Uuid>) -> bool {
        let Some(clauses) = self.prereqs.get(guid) else {
            return false;
        };
        clauses.iter().all(|clause| match clause {
            PrereqClause::Simple(required) => {
                self.contains(required) && installed.contains(required)
            }
            PrereqClause::AtLeastOne { is_category: true, .. } => true,
            PrereqClause::AtLeastOne { is_category: false, guids } => {
                guids.iter().any(|g| self.contains(g) && installed.contains(g))
            }
        })
    }

    /// Whether `guid` is scoped to at least one of the given categories,
    /// i.e. its prerequisite tree carries a category clause naming one.
    pub fn matches_categories(&self, guid: &Uuid, categories: &HashSet<Uuid>) -> bool {
        let Some(clauses) = self.prereqs.get(guid) else {
            return false;
        };
        clauses.iter().any(|clause| {
            matches!(
                clause,
                PrereqClause::AtLeastOne { is_category: true, guids }
                    if guids.iter().any(|g| categories.contains(g))
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::UpdateIdentity;
    use bytes::Bytes;

    fn pkg(guid: Uuid, kind: PackageKind, prereqs: Vec<PrereqClause>) -> Package {
        Package {
            identity: UpdateIdentity::new(guid, 1),
            kind,
            title: None,
            kb_article: None,
            prerequisites: prereqs,
            bundled_with: Vec::new(),
            bundled_updates: Vec::new(),
            files: Vec::new(),
            driver_ids: Vec::new(),
            xml: Bytes::from_static(b"<Update/>"),
        }
    }

    /// Three-tier corpus: root detectoid, non-leaf detectoid, software leaf.
    fn corpus() -> (Uuid, Uuid, Uuid, Vec<Package>) {
        let root = Uuid::new_v4();
        let mid = Uuid::new_v4();
        let leaf = Uuid::new_v4();
        let packages = vec![
            pkg(root, PackageKind::Detectoid, vec![]),
            pkg(mid, PackageKind::Detectoid, vec![PrereqClause::Simple(root)]),
            pkg(leaf, PackageKind::Software, vec![PrereqClause::Simple(mid)]),
        ];
        (root, mid, leaf, packages)
    }

    #[test]
    fn test_partition_is_disjoint_and_covering() {
        let (root, mid, leaf, packages) = corpus();
        let graph = PrerequisiteGraph::build(&packages);

        assert!(graph.roots().contains(&root));
        assert!(graph.non_leafs().contains(&mid));
        assert!(graph.leaves().contains(&leaf));
        assert!(graph.software_leaf_guids().contains(&leaf));

        let total = graph.roots().len() + graph.non_leafs().len() + graph.leaves().len();
        assert_eq!(total, packages.len());
        assert!(graph.roots().is_disjoint(graph.non_leafs()));
        assert!(graph.roots().is_disjoint(graph.leaves()));
        assert!(graph.non_leafs().is_disjoint(graph.leaves()));
    }

    #[test]
    fn test_applicability_follows_installed_set() {
        let (root, mid, leaf, packages) = corpus();
        let graph = PrerequisiteGraph::build(&packages);

        let empty = HashSet::new();
        assert!(!graph.is_applicable(&mid, &empty));
        assert!(!graph.is_applicable(&leaf, &empty));

        let installed: HashSet<Uuid> = [root].into();
        assert!(graph.is_applicable(&mid, &installed));
        assert!(!graph.is_applicable(&leaf, &installed));

        let installed: HashSet<Uuid> = [root, mid].into();
        assert!(graph.is_applicable(&leaf, &installed));
    }

    #[test]
    fn test_at_least_one_any_child_satisfies() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let leaf = Uuid::new_v4();
        let packages = vec![
            pkg(a, PackageKind::Detectoid, vec![]),
            pkg(b, PackageKind::Detectoid, vec![]),
            pkg(
                leaf,
                PackageKind::Software,
                vec![PrereqClause::AtLeastOne { guids: vec![a, b], is_category: false }],
            ),
        ];
        let graph = PrerequisiteGraph::build(&packages);
        assert!(graph.is_applicable(&leaf, &[b].into()));
        assert!(!graph.is_applicable(&leaf, &HashSet::new()));
    }

    #[test]
    fn test_unresolved_prerequisite_blocks_applicability() {
        let ghost = Uuid::new_v4();
        let leaf = Uuid::new_v4();
        let packages = vec![pkg(
            leaf,
            PackageKind::Software,
            vec![PrereqClause::Simple(ghost)],
        )];
        let graph = PrerequisiteGraph::build(&packages);
        // Even if the client claims the ghost, it does not resolve.
        assert!(!graph.is_applicable(&leaf, &[ghost].into()));
    }

    #[test]
    fn test_category_clause_scopes_but_does_not_gate() {
        let product = Uuid::new_v4();
        let root = Uuid::new_v4();
        let leaf = Uuid::new_v4();
        let packages = vec![
            pkg(product, PackageKind::Product, vec![]),
            pkg(root, PackageKind::Detectoid, vec![]),
            pkg(
                leaf,
                PackageKind::Software,
                vec![
                    PrereqClause::Simple(root),
                    PrereqClause::AtLeastOne { guids: vec![product], is_category: true },
                ],
            ),
        ];
        let graph = PrerequisiteGraph::build(&packages);

        // Category clause does not require the category to be "installed".
        assert!(graph.is_applicable(&leaf, &[root].into()));

        assert!(graph.matches_categories(&leaf, &[product].into()));
        assert!(!graph.matches_categories(&leaf, &[Uuid::new_v4()].into()));
        assert!(!graph.matches_categories(&root, &[product].into()));
    }

    #[test]
    fn test_unresolved_category_clause_does_not_block_applicability() {
        // Categories routinely name GUIDs broader than the synced catalog.
        let ghost_category = Uuid::new_v4();
        let root = Uuid::new_v4();
        let leaf = Uuid::new_v4();
        let packages = vec![
            pkg(root, PackageKind::Detectoid, vec![]),
            pkg(
                leaf,
                PackageKind::Software,
                vec![
                    PrereqClause::Simple(root),
                    PrereqClause::AtLeastOne { guids: vec![ghost_category], is_category: true },
                ],
            ),
        ];
        let graph = PrerequisiteGraph::build(&packages);

        assert!(graph.is_applicable(&leaf, &[root].into()));
        // The unresolved GUID still scopes nothing.
        assert!(!graph.matches_categories(&leaf, &[Uuid::new_v4()].into()));
        assert!(graph.matches_categories(&leaf, &[ghost_category].into()));
    }
}

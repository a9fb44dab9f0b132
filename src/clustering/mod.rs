pub mod canonical_groups;

//! Ownership graph of the records belonging to one applicant.
//!
//! Deletion order is derived from the graph rather than listed by hand: a post-order walk from
//! [`EntityKind::Applicant`] visits every child before its owner.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Applicant,
    ExamTicket,
    WaitlistEntry,
    EnrollmentApplication,
    Document,
    PaymentRecord,
    AuditEntry,
}

impl EntityKind {
    /// Records owned directly by `self`.
    pub const fn children(self) -> &'static [EntityKind] {
        match self {
            EntityKind::Applicant => &[
                EntityKind::EnrollmentApplication,
                EntityKind::ExamTicket,
                EntityKind::AuditEntry,
            ],
            EntityKind::EnrollmentApplication => {
                &[EntityKind::Document, EntityKind::PaymentRecord]
            }
            EntityKind::ExamTicket => &[EntityKind::WaitlistEntry],
            EntityKind::WaitlistEntry
            | EntityKind::Document
            | EntityKind::PaymentRecord
            | EntityKind::AuditEntry => &[],
        }
    }
}

/// Children-before-parents order for deleting everything under `root`.
pub fn deletion_order(root: EntityKind) -> Vec<EntityKind> {
    let mut order = Vec::new();
    visit(root, &mut order);
    order
}

fn visit(kind: EntityKind, order: &mut Vec<EntityKind>) {
    for child in kind.children() {
        visit(*child, order);
    }
    if !order.contains(&kind) {
        order.push(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applicant_cascade_deletes_children_first() {
        assert_eq!(
            deletion_order(EntityKind::Applicant),
            vec![
                EntityKind::Document,
                EntityKind::PaymentRecord,
                EntityKind::EnrollmentApplication,
                EntityKind::WaitlistEntry,
                EntityKind::ExamTicket,
                EntityKind::AuditEntry,
                EntityKind::Applicant,
            ]
        );
    }

    #[test]
    fn every_owner_follows_its_children() {
        let order = deletion_order(EntityKind::Applicant);
        for (index, kind) in order.iter().enumerate() {
            for child in kind.children() {
                let child_index = order
                    .iter()
                    .position(|candidate| candidate == child)
                    .expect("child is part of the cascade");
                assert!(child_index < index, "{child:?} must precede {kind:?}");
            }
        }
    }
}

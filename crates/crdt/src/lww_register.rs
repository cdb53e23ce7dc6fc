use crate::Crdt;
use distlab_core::ParticipantId;

/// Last-writer-wins register.
///
/// Writes are stamped `(counter, replica)`, where the counter is one past
/// the highest stamp the replica has seen; ties between replicas break on
/// the replica id, so every replica picks the same winner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LwwRegister {
    value: Option<String>,
    stamp: Option<(u64, ParticipantId)>,
}

impl LwwRegister {
    pub fn stamp(&self) -> Option<&(u64, ParticipantId)> {
        self.stamp.as_ref()
    }
}

impl Crdt for LwwRegister {
    type Op = String;
    type Value = Option<String>;

    const NAME: &'static str = "lww-register";

    fn apply(&mut self, replica: &ParticipantId, value: String) {
        let counter = self.stamp.as_ref().map_or(0, |(c, _)| *c) + 1;
        self.stamp = Some((counter, replica.clone()));
        self.value = Some(value);
    }

    fn merge(&mut self, other: &Self) {
        if other.stamp > self.stamp {
            self.stamp = other.stamp.clone();
            self.value = other.value.clone();
        }
    }

    fn value(&self) -> Option<String> {
        self.value.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_later_write_wins() {
        let mut a = LwwRegister::default();
        a.apply(&ParticipantId::from("r0"), "first".into());
        let mut b = a.clone();
        b.apply(&ParticipantId::from("r1"), "second".into());

        a.merge(&b);
        assert_eq!(a.value().as_deref(), Some("second"));
    }

    #[test]
    fn test_concurrent_writes_break_ties_by_replica() {
        let mut a = LwwRegister::default();
        let mut b = LwwRegister::default();
        a.apply(&ParticipantId::from("r0"), "from-r0".into());
        b.apply(&ParticipantId::from("r1"), "from-r1".into());

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);
        assert_eq!(ab.value().as_deref(), Some("from-r1"));

        let snapshot = ab.clone();
        ab.merge(&snapshot);
        assert_eq!(ab, snapshot);
    }
}

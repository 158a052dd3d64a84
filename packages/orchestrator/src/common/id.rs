use uuid::Uuid;

/// Generate a new database identifier.
///
/// v4 UUIDs everywhere; ids are opaque and never encode ordering.
pub fn db_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(db_id(), db_id());
    }
}

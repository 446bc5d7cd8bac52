use state_machines::state_machine;

state_machine! {
    name: IngestionMachine,
    state: IngestionState,
    initial: Discovered,
    states: [
        Discovered,
        Hashed,
        SkippedUnchanged,
        ExtractionNative,
        ExtractionOcr,
        MetadataExtracted,
        ConceptsMatched,
        Assembled,
        Indexed,
        Failed
    ],
    events {
        hash { transition: { from: Discovered, to: Hashed } }
        skip_unchanged { transition: { from: Hashed, to: SkippedUnchanged } }
        record_alias { transition: { from: Hashed, to: Indexed } }
        extract_native { transition: { from: Hashed, to: ExtractionNative } }
        extract_ocr { transition: { from: Hashed, to: ExtractionOcr } }
        extract_metadata {
            transition: { from: ExtractionNative, to: MetadataExtracted }
            transition: { from: ExtractionOcr, to: MetadataExtracted }
        }
        match_concepts { transition: { from: MetadataExtracted, to: ConceptsMatched } }
        assemble { transition: { from: ConceptsMatched, to: Assembled } }
        index { transition: { from: Assembled, to: Indexed } }
        abort {
            transition: { from: Discovered, to: Failed }
            transition: { from: Hashed, to: Failed }
            transition: { from: ExtractionNative, to: Failed }
            transition: { from: ExtractionOcr, to: Failed }
            transition: { from: MetadataExtracted, to: Failed }
            transition: { from: ConceptsMatched, to: Failed }
            transition: { from: Assembled, to: Failed }
        }
    }
}

pub fn discovered() -> IngestionMachine<(), Discovered> {
    IngestionMachine::new(())
}

/// Lifecycle of a deletion event: the path either held an indexed document or it did not.
pub mod removal {
    use state_machines::state_machine;

    state_machine! {
        name: RemovalMachine,
        state: RemovalState,
        initial: Tracked,
        states: [Tracked, Removed, NotIndexed, Failed],
        events {
            remove { transition: { from: Tracked, to: Removed } }
            skip { transition: { from: Tracked, to: NotIndexed } }
            abort { transition: { from: Tracked, to: Failed } }
        }
    }

    pub fn tracked() -> RemovalMachine<(), Tracked> {
        RemovalMachine::new(())
    }
}

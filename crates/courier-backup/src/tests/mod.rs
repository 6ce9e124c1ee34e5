
use crate::frame::{KeyValueContent, SqlParameter, SqlStatement};
use crate::source::{BlobKind, InMemoryDataSource, TableRow};

pub fn row(table: &str, values: Vec<SqlParameter>) -> TableRow {
    TableRow::live(SqlStatement {
        statement: format!("INSERT INTO {} VALUES (?)", table),
        parameters: values,
    })
}

pub fn sample_source() -> InMemoryDataSource {
    let mut source = InMemoryDataSource::new(42);
    source.add_table(
        "messages",
        vec![
            row(
                "messages",
                vec![
                    SqlParameter::Integer(1),
                    SqlParameter::Text("hello".to_string()),
                ],
            ),
            row(
                "messages",
                vec![
                    SqlParameter::Integer(2),
                    SqlParameter::Blob(vec![0xAB, 0xCD]),
                    SqlParameter::Null,
                ],
            ),
        ],
    );
    source.add_table(
        "recipients",
        vec![row(
            "recipients",
            vec![SqlParameter::Text("alice".to_string())],
        )],
    );
    source.add_index("CREATE INDEX messages_idx ON messages (data)");
    source
        .preferences
        .push(("settings".to_string(), "theme".to_string(), "dark".to_string()));
    source.key_values.push((
        "registration.id".to_string(),
        KeyValueContent::Integer(4711),
    ));
    source.add_blob(BlobKind::Attachment { row_id: 7 }, vec![9u8; 20_000]);
    source.add_blob(
        BlobKind::Avatar {
            recipient_id: "alice".to_string(),
        },
        b"avatar-bytes".to_vec(),
    );
    source
}

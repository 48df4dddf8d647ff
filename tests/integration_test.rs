use anyhow::Result;
use pretty_assertions::assert_eq;

use stratadb::btree::cursor::Cursor;
use stratadb::btree::TreeKind;
use stratadb::{Database, JournalMode, OpenOptions, SqlValue};

fn temp_dir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("stratadb-it-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("should create temp dir");
    dir
}

fn temp_db_path(name: &str) -> String {
    let path = temp_dir().join(name);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(format!("{}-journal", path.display()));
    let _ = std::fs::remove_file(format!("{}-wal", path.display()));
    path.to_string_lossy().into_owned()
}

#[test]
fn test_create_insert_select_single_row() -> Result<()> {
    let db = stratadb::create_memory()?;
    db.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", &[])?;
    db.execute("INSERT INTO users (id, name) VALUES (1, 'Alice'), (2, 'Bob')", &[])?;

    let out = db.query("SELECT name FROM users WHERE id = 2", &[])?;
    assert_eq!(out.columns, vec!["name".to_string()]);
    assert_eq!(out.rows, vec![vec![SqlValue::Text("Bob".into())]]);
    Ok(())
}

#[test]
fn test_index_build_scan_and_seek() -> Result<()> {
    let db = stratadb::create_memory()?;
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])?;
    {
        let mut tx = db.begin_transaction()?;
        for i in 0..250i64 {
            tx.insert(
                "t",
                vec![SqlValue::Null(), SqlValue::Text(format!("name_{:04}", i))],
            )?;
        }
        tx.commit()?;
    }
    db.execute("CREATE INDEX idx ON t (name)", &[])?;

    let schema = db.schema()?;
    let index = schema.index("idx")?.clone();

    // The index b-tree holds every entry in BINARY key order.
    let mut cursor = Cursor::new(db.page_source(), index.root_page, TreeKind::Index, db.usable());
    let mut names = vec![];
    while cursor.move_next()? {
        let payload = cursor.payload()?.to_vec();
        let entry = stratadb::record::decode_record(&payload)?;
        names.push(entry[0].as_text().expect("index key should be text").clone());
    }
    assert_eq!(names.len(), 250);
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);

    // A seek lands on the row owning the key: rows were rowid 1..=250 for
    // names name_0000..name_0249.
    let mut cursor = Cursor::new(db.page_source(), index.root_page, TreeKind::Index, db.usable());
    assert!(cursor.seek_record(&[SqlValue::Text("name_0100".into())])?);
    let payload = cursor.payload()?.to_vec();
    let entry = stratadb::record::decode_record(&payload)?;
    assert_eq!(entry[1], SqlValue::Int(101));
    Ok(())
}

#[test]
fn test_multi_page_table_keeps_root_and_order() -> Result<()> {
    let path = temp_db_path("multipage.db");
    let db = stratadb::create(&path)?;
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, body TEXT)", &[])?;
    let root_before = db.schema()?.table("t")?.root_page;

    {
        let mut tx = db.begin_transaction()?;
        for i in 1..=200i64 {
            let body = format!("{:078}", i); // ~80 bytes of payload per row
            tx.insert("t", vec![SqlValue::Int(i), SqlValue::Text(body)])?;
        }
        tx.commit()?;
    }

    assert!(db.header().page_count > 2, "rows should span several pages");
    assert_eq!(db.schema()?.table("t")?.root_page, root_before, "root must be retained");

    let mut reader = db.create_reader("t", None, None)?;
    let mut rowids = vec![];
    while reader.read()? {
        rowids.push(reader.row_id());
    }
    assert_eq!(rowids, (1..=200).collect::<Vec<i64>>());

    // Reopen from disk and scan again.
    drop(db);
    let db = stratadb::open(&path)?;
    let out = db.query("SELECT id FROM t ORDER BY id LIMIT 3", &[])?;
    assert_eq!(
        out.rows,
        vec![
            vec![SqlValue::Int(1)],
            vec![SqlValue::Int(2)],
            vec![SqlValue::Int(3)]
        ]
    );
    Ok(())
}

#[test]
fn test_rollback_discards_rows_and_change_counter() -> Result<()> {
    let path = temp_db_path("rollback.db");
    let db = stratadb::create(&path)?;
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])?;
    let counter_before = db.header().change_counter;

    {
        let mut tx = db.begin_transaction()?;
        for i in 1..=3i64 {
            tx.insert("t", vec![SqlValue::Int(i), SqlValue::Text("x".into())])?;
        }
        tx.rollback()?;
    }

    let out = db.query("SELECT id FROM t", &[])?;
    assert_eq!(out.rows.len(), 0);
    assert_eq!(db.header().change_counter, counter_before);

    // The on-disk header is untouched too.
    drop(db);
    let db = stratadb::open(&path)?;
    assert_eq!(db.header().change_counter, counter_before);
    Ok(())
}

#[test]
fn test_overflow_record_round_trip_and_free() -> Result<()> {
    let db = stratadb::create_memory()?;
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, data BLOB)", &[])?;
    let big = vec![0x5au8; 4100];
    {
        let mut tx = db.begin_transaction()?;
        tx.insert("t", vec![SqlValue::Int(1), SqlValue::Blob(big.clone())])?;
        tx.commit()?;
    }

    // The cursor follows the overflow pointer and returns the full bytes.
    let mut reader = db.create_reader("t", None, None)?;
    assert!(reader.read()?);
    assert_eq!(reader.get_blob_span(1)?, Some(&big[..]));
    drop(reader);
    assert_eq!(db.header().freelist_count, 0);

    // Shrinking the record frees the chain page back to the freelist.
    {
        let mut tx = db.begin_transaction()?;
        assert!(tx.update("t", 1, vec![SqlValue::Int(1), SqlValue::Blob(vec![1, 2, 3])])?);
        tx.commit()?;
    }
    assert_eq!(db.header().freelist_count, 1);
    let mut reader = db.create_reader("t", None, None)?;
    assert!(reader.read()?);
    assert_eq!(reader.get_blob_span(1)?, Some(&[1u8, 2, 3][..]));
    Ok(())
}

#[test]
fn test_union_and_intersect_fingerprint_dedup() -> Result<()> {
    let db = stratadb::create_memory()?;
    db.execute("CREATE TABLE a (id INTEGER PRIMARY KEY)", &[])?;
    db.execute("CREATE TABLE b (id INTEGER PRIMARY KEY)", &[])?;
    {
        let mut tx = db.begin_transaction()?;
        // a holds 1..=2500; b holds 2001..=4500; 500 ids overlap.
        for i in 1..=2500i64 {
            tx.insert("a", vec![SqlValue::Int(i)])?;
        }
        for i in 2001..=4500i64 {
            tx.insert("b", vec![SqlValue::Int(i)])?;
        }
        tx.commit()?;
    }

    let union = db.query("SELECT id FROM a UNION SELECT id FROM b", &[])?;
    assert_eq!(union.rows.len(), 4500);
    let intersect = db.query("SELECT id FROM a INTERSECT SELECT id FROM b", &[])?;
    assert_eq!(intersect.rows.len(), 500);
    let except = db.query("SELECT id FROM a EXCEPT SELECT id FROM b", &[])?;
    assert_eq!(except.rows.len(), 2000);
    Ok(())
}

#[test]
fn test_reader_staleness_after_commit() -> Result<()> {
    let db = stratadb::create_memory()?;
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])?;
    db.execute("INSERT INTO t (id) VALUES (1)", &[])?;

    let mut reader = db.create_reader("t", None, None)?;
    assert!(reader.read()?);
    assert!(!reader.is_stale());

    db.execute("INSERT INTO t (id) VALUES (2)", &[])?;
    assert!(reader.is_stale(), "a commit must flip the staleness signal");

    // Reset refreshes the snapshot and sees the new row.
    reader.reset();
    assert!(!reader.is_stale());
    let mut count = 0;
    while reader.read()? {
        count += 1;
    }
    assert_eq!(count, 2);
    Ok(())
}

#[test]
fn test_second_writer_fails_fast() -> Result<()> {
    let db = stratadb::create_memory()?;
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])?;
    let _tx = db.begin_transaction()?;
    match db.begin_transaction() {
        Err(stratadb::Error::TransactionAlreadyActive) => {}
        other => panic!("expected TransactionAlreadyActive, got {:?}", other.map(|_| ())),
    }
    Ok(())
}

#[test]
fn test_wal_mode_commit_recover_checkpoint() -> Result<()> {
    let path = temp_db_path("wal_mode.db");
    {
        let db = Database::create(&path, OpenOptions::default().journal(JournalMode::Wal))?;
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])?;
        db.execute("INSERT INTO t (id, name) VALUES (1, 'walrus')", &[])?;
        let out = db.query("SELECT name FROM t WHERE id = 1", &[])?;
        assert_eq!(out.rows, vec![vec![SqlValue::Text("walrus".into())]]);
    }
    // The log exists and replays on reopen.
    assert!(std::path::Path::new(&format!("{}-wal", path)).exists());
    {
        let db = Database::open(&path, OpenOptions::default().writable(true).journal(JournalMode::Wal))?;
        let out = db.query("SELECT name FROM t WHERE id = 1", &[])?;
        assert_eq!(out.rows, vec![vec![SqlValue::Text("walrus".into())]]);
        let moved = db.checkpoint()?;
        assert!(moved > 0, "checkpoint should merge committed frames");
        let out = db.query("SELECT name FROM t WHERE id = 1", &[])?;
        assert_eq!(out.rows, vec![vec![SqlValue::Text("walrus".into())]]);
    }
    // After the checkpoint the base file alone carries the data.
    let db = Database::open(&path, OpenOptions::default())?;
    let out = db.query("SELECT name FROM t", &[])?;
    assert_eq!(out.rows.len(), 1);
    Ok(())
}

#[test]
fn test_aggregation_group_by_and_having() -> Result<()> {
    let db = stratadb::create_memory()?;
    db.execute("CREATE TABLE sales (id INTEGER PRIMARY KEY, region TEXT, amount INT)", &[])?;
    db.execute(
        "INSERT INTO sales (region, amount) VALUES \
         ('north', 10), ('north', 20), ('south', 5), ('south', 7), ('west', 100)",
        &[],
    )?;

    let out = db.query(
        "SELECT region, COUNT(*) AS n, SUM(amount) AS total FROM sales GROUP BY region ORDER BY region",
        &[],
    )?;
    assert_eq!(out.columns, vec!["region", "n", "total"]);
    assert_eq!(
        out.rows,
        vec![
            vec![SqlValue::Text("north".into()), SqlValue::Int(2), SqlValue::Int(30)],
            vec![SqlValue::Text("south".into()), SqlValue::Int(2), SqlValue::Int(12)],
            vec![SqlValue::Text("west".into()), SqlValue::Int(1), SqlValue::Int(100)],
        ]
    );

    let out = db.query(
        "SELECT region, SUM(amount) AS total FROM sales GROUP BY region HAVING total > 20 ORDER BY region",
        &[],
    )?;
    assert_eq!(out.rows.len(), 2);

    let out = db.query("SELECT MIN(amount), MAX(amount), AVG(amount) FROM sales", &[])?;
    assert_eq!(
        out.rows,
        vec![vec![SqlValue::Int(5), SqlValue::Int(100), SqlValue::Real(28.4)]]
    );
    Ok(())
}

#[test]
fn test_order_by_limit_top_k_and_params() -> Result<()> {
    let db = stratadb::create_memory()?;
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, score INT)", &[])?;
    {
        let mut tx = db.begin_transaction()?;
        for i in 1..=100i64 {
            tx.insert("t", vec![SqlValue::Int(i), SqlValue::Int((i * 37) % 101)])?;
        }
        tx.commit()?;
    }

    let out = db.query("SELECT id, score FROM t ORDER BY score DESC LIMIT 5", &[])?;
    assert_eq!(out.rows.len(), 5);
    let scores: Vec<i64> = out.rows.iter().map(|r| *r[1].as_int().unwrap()).collect();
    let mut sorted = scores.clone();
    sorted.sort_by(|a, b| b.cmp(a));
    assert_eq!(scores, sorted);
    assert_eq!(scores[0], 100);

    let out = db.query(
        "SELECT id FROM t WHERE score > $floor ORDER BY id LIMIT 3 OFFSET 1",
        &[("floor".to_string(), SqlValue::Int(95))],
    )?;
    assert_eq!(out.rows.len(), 3);
    Ok(())
}

#[test]
fn test_uuid_and_decimal_round_trip() -> Result<()> {
    let db = stratadb::create_memory()?;
    db.execute(
        "CREATE TABLE wallets (id INTEGER PRIMARY KEY, owner UUID, balance DECIMAL(20,6))",
        &[],
    )?;
    let uuid_text = "00112233-4455-6677-8899-aabbccddeeff";
    {
        let mut tx = db.begin_transaction()?;
        tx.insert(
            "wallets",
            vec![
                SqlValue::Int(1),
                SqlValue::Text(uuid_text.into()),
                SqlValue::Text("42.000001".into()),
            ],
        )?;
        tx.commit()?;
    }

    // The logical column splits into two physical integer columns.
    let schema = db.schema()?;
    let table = schema.table("wallets")?;
    assert_eq!(table.columns[1].merged_physical_ordinals, vec![1, 2]);
    assert_eq!(table.columns[2].merged_physical_ordinals, vec![3, 4]);

    let mut reader = db.create_reader("wallets", None, None)?;
    assert!(reader.read()?);
    assert_eq!(
        reader.get_uuid(1)?,
        Some(0x00112233_4455_6677_8899_aabbccddeeffu128)
    );
    assert_eq!(reader.get_decimal(2)?, Some((42_000_001, 6)));
    drop(reader);

    // Filters see the merged value as one 128-bit comparison.
    let out = db.query(
        &format!("SELECT id FROM wallets WHERE owner = '{}'", uuid_text),
        &[],
    )?;
    assert_eq!(out.rows, vec![vec![SqlValue::Int(1)]]);
    Ok(())
}

#[test]
fn test_alter_and_drop() -> Result<()> {
    let db = stratadb::create_memory()?;
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])?;
    db.execute("INSERT INTO t (name) VALUES ('before-alter')", &[])?;
    db.execute("ALTER TABLE t ADD COLUMN age INT", &[])?;

    // Old rows read the new trailing column as NULL.
    let out = db.query("SELECT name, age FROM t", &[])?;
    assert_eq!(
        out.rows,
        vec![vec![SqlValue::Text("before-alter".into()), SqlValue::Null()]]
    );
    db.execute("INSERT INTO t (name, age) VALUES ('after-alter', 9)", &[])?;
    let out = db.query("SELECT age FROM t WHERE name = 'after-alter'", &[])?;
    assert_eq!(out.rows, vec![vec![SqlValue::Int(9)]]);

    db.execute("ALTER TABLE t RENAME TO people", &[])?;
    assert!(db.query("SELECT * FROM t", &[]).is_err());
    assert_eq!(db.query("SELECT * FROM people", &[])?.rows.len(), 2);

    db.execute("DROP TABLE people", &[])?;
    assert!(db.query("SELECT * FROM people", &[]).is_err());
    // The dropped tree's pages are reusable.
    assert!(db.header().freelist_count > 0);
    Ok(())
}

#[test]
fn test_update_delete_with_where() -> Result<()> {
    let db = stratadb::create_memory()?;
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, score INT)", &[])?;
    db.execute(
        "INSERT INTO t (name, score) VALUES ('a', 1), ('b', 2), ('c', 3), ('d', 4)",
        &[],
    )?;

    let n = db.execute("UPDATE t SET score = score + 10 WHERE score > 2", &[])?;
    assert_eq!(n, 2);
    let out = db.query("SELECT name FROM t WHERE score > 10 ORDER BY name", &[])?;
    assert_eq!(
        out.rows,
        vec![vec![SqlValue::Text("c".into())], vec![SqlValue::Text("d".into())]]
    );

    let n = db.execute("DELETE FROM t WHERE score BETWEEN 1 AND 2", &[])?;
    assert_eq!(n, 2);
    assert_eq!(db.query("SELECT id FROM t", &[])?.rows.len(), 2);
    Ok(())
}

#[test]
fn test_distinct_cte_and_subquery() -> Result<()> {
    let db = stratadb::create_memory()?;
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, tag TEXT)", &[])?;
    db.execute(
        "INSERT INTO t (tag) VALUES ('x'), ('y'), ('x'), ('z'), ('y')",
        &[],
    )?;

    let out = db.query("SELECT DISTINCT tag FROM t ORDER BY tag", &[])?;
    assert_eq!(out.rows.len(), 3);

    let out = db.query(
        "WITH tags AS (SELECT tag FROM t) SELECT COUNT(*) FROM (SELECT DISTINCT tag FROM tags) d",
        &[],
    )?;
    assert_eq!(out.rows, vec![vec![SqlValue::Int(3)]]);
    Ok(())
}

#[test]
fn test_schema_table_is_queryable() -> Result<()> {
    let db = stratadb::create_memory()?;
    db.execute("CREATE TABLE alpha (id INTEGER PRIMARY KEY)", &[])?;
    db.execute("CREATE TABLE beta (id INTEGER PRIMARY KEY)", &[])?;
    db.execute("CREATE INDEX beta_id ON beta (id)", &[])?;

    let out = db.query(
        "SELECT name FROM sqlite_schema WHERE type = 'table' ORDER BY name",
        &[],
    )?;
    assert_eq!(
        out.rows,
        vec![
            vec![SqlValue::Text("alpha".into())],
            vec![SqlValue::Text("beta".into())]
        ]
    );
    Ok(())
}

#[test]
fn test_file_round_trip_reopen() -> Result<()> {
    let path = temp_db_path("roundtrip.db");
    {
        let db = stratadb::create(&path)?;
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])?;
        db.execute("INSERT INTO t (name) VALUES ('persisted')", &[])?;
    }
    let db = stratadb::open(&path)?;
    let out = db.query("SELECT name FROM t", &[])?;
    assert_eq!(out.rows, vec![vec![SqlValue::Text("persisted".into())]]);
    // Read-only handles refuse writers.
    assert!(matches!(db.begin_transaction(), Err(stratadb::Error::ReadOnly)));
    Ok(())
}

#[test]
fn test_parse_error_has_offset_and_missing_table_is_named() -> Result<()> {
    let db = stratadb::create_memory()?;
    match db.query("SELECT FROM", &[]) {
        Err(stratadb::Error::ParseError { offset, .. }) => assert_eq!(offset, 7),
        other => panic!("expected a parse error, got {:?}", other.map(|_| ())),
    }
    match db.query("SELECT * FROM missing", &[]) {
        Err(stratadb::Error::SchemaNotFound(name)) => assert_eq!(name, "missing"),
        other => panic!("expected SchemaNotFound, got {:?}", other.map(|_| ())),
    }
    Ok(())
}

mod helpers;

use helpers::memory;
use odbc_access::{
    CellValue, Date, OdbcError, ParamDirection, SqlType, Statement, Timestamp,
};

#[test]
fn test_scalar_round_trips() {
    let (_memory, conn) = memory("round_trip");
    conn.just_execute(
        "CREATE TABLE scalars (s SMALLINT, i INT, b BIGINT, r REAL, d DOUBLE, \
         flag BIT, name VARCHAR(40), day DATE, at TIMESTAMP)",
    )
    .unwrap();

    let day = Date::new(2024, 2, 29);
    let at = Timestamp::new(2023, 12, 31, 23, 59, 58);
    let stmt = Statement::with_query(
        &conn,
        "INSERT INTO scalars VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .unwrap();
    stmt.bind(0, &-12i16).unwrap();
    stmt.bind(1, &2_000_000i32).unwrap();
    stmt.bind(2, &9_000_000_000i64).unwrap();
    stmt.bind(3, &1.5f32).unwrap();
    stmt.bind(4, &-2.25f64).unwrap();
    stmt.bind(5, &true).unwrap();
    stmt.bind(6, "héllo wörld").unwrap();
    stmt.bind(7, &day).unwrap();
    stmt.bind(8, &at).unwrap();
    stmt.just_execute().unwrap();

    let result = conn.execute("SELECT * FROM scalars").unwrap();
    assert!(result.next().unwrap());
    assert_eq!(result.get::<i16>(0).unwrap(), -12);
    assert_eq!(result.get::<i32>(1).unwrap(), 2_000_000);
    assert_eq!(result.get::<i64>(2).unwrap(), 9_000_000_000);
    assert_eq!(result.get::<f32>(3).unwrap(), 1.5);
    assert_eq!(result.get::<f64>(4).unwrap(), -2.25);
    assert!(result.get::<bool>(5).unwrap());
    assert_eq!(result.get::<String>(6).unwrap(), "héllo wörld");
    assert_eq!(result.get::<Date>(7).unwrap(), day);
    assert_eq!(result.get::<Timestamp>(8).unwrap(), at);
    assert!(!result.next().unwrap());
}

#[test]
fn test_incompatible_conversions() {
    let (_memory, conn) = memory("incompatible");
    conn.just_execute("CREATE TABLE t (big BIGINT, day DATE)").unwrap();
    conn.just_execute("INSERT INTO t VALUES (9000000000, '2020-01-02')")
        .unwrap();
    let result = conn.execute("SELECT big, day FROM t").unwrap();
    assert!(result.next().unwrap());
    assert!(matches!(
        result.get::<i32>(0),
        Err(OdbcError::TypeIncompatible(_))
    ));
    assert!(matches!(
        result.get::<i64>(1),
        Err(OdbcError::TypeIncompatible(_))
    ));
    assert_eq!(result.get::<String>(0).unwrap(), "9000000000");
    assert!(matches!(
        result.get::<CellValue>(1).unwrap(),
        CellValue::Date(_)
    ));
}

#[test]
fn test_null_reads_back_with_fallback() {
    let (_memory, conn) = memory("nulls");
    conn.just_execute("CREATE TABLE t (id INT, note VARCHAR(10))").unwrap();
    let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?, ?)").unwrap();
    stmt.bind(0, &1i32).unwrap();
    stmt.bind_null(1, 1).unwrap();
    stmt.just_execute().unwrap();

    let result = conn.execute("SELECT id, note FROM t").unwrap();
    assert!(result.next().unwrap());
    assert!(!result.is_null(0).unwrap());
    assert!(result.is_null(1).unwrap());
    assert_eq!(result.get_or(1, "fallback".to_string()).unwrap(), "fallback");
    assert!(matches!(result.get::<String>(1), Err(OdbcError::NullAccess)));
}

#[test]
fn test_fetch_exhaustion() {
    let (_memory, conn) = memory("exhaustion");
    conn.just_execute("CREATE TABLE t (id INT)").unwrap();
    let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?)").unwrap();
    stmt.bind_array(0, &[1i32, 2, 3, 4, 5]).unwrap();
    stmt.just_execute().unwrap();

    for rowset in [1usize, 2, 5, 8] {
        let query = Statement::with_connection(&conn).unwrap();
        query.set_rowset_size(rowset).unwrap();
        let result = query.execute_direct(&conn, "SELECT id FROM t").unwrap();
        let mut trues = 0;
        while result.next().unwrap() {
            trues += 1;
        }
        assert_eq!(trues, 5, "rowset size {}", rowset);
        assert!(result.end());
        for _ in 0..3 {
            assert!(!result.next().unwrap());
        }
        assert!(result.end());
    }
}

#[test]
fn test_column_index_out_of_range_at_every_position() {
    let (_memory, conn) = memory("index_range");
    conn.just_execute("CREATE TABLE t (a INT, b INT)").unwrap();
    conn.just_execute("INSERT INTO t VALUES (1, 2)").unwrap();
    let result = conn.execute("SELECT a, b FROM t").unwrap();

    assert!(matches!(result.get::<i32>(2), Err(OdbcError::IndexRange(_))));
    assert!(result.next().unwrap());
    assert!(matches!(result.get::<i32>(2), Err(OdbcError::IndexRange(_))));
    assert!(matches!(
        result.get_or::<i32>(7, 0),
        Err(OdbcError::IndexRange(_))
    ));
    assert!(!result.next().unwrap());
    assert!(matches!(result.get::<i32>(2), Err(OdbcError::IndexRange(_))));
}

#[test]
fn test_value_larger_than_buffer_floor() {
    let (_memory, conn) = memory("large");
    // Unbounded types are bound at the 1024-byte floor.
    conn.just_execute("CREATE TABLE docs (body TEXT, raw BLOB)").unwrap();
    let body: String = (0..1579).map(|i| (b'a' + (i % 26) as u8) as char).collect();
    let raw: Vec<u8> = (0..1579u32).map(|i| (i % 251) as u8).collect();

    let stmt = Statement::with_query(&conn, "INSERT INTO docs VALUES (?, ?)").unwrap();
    stmt.bind(0, body.as_str()).unwrap();
    stmt.bind(1, raw.as_slice()).unwrap();
    stmt.just_execute().unwrap();

    let query = Statement::with_connection(&conn).unwrap();
    query.set_rowset_size(1).unwrap();
    let result = query
        .execute_direct(&conn, "SELECT body, raw FROM docs")
        .unwrap();
    assert!(result.next().unwrap());
    let read_body = result.get::<String>(0).unwrap();
    assert_eq!(read_body.len(), 1579);
    assert_eq!(read_body, body);
    assert_eq!(result.get::<Vec<u8>>(1).unwrap(), raw);
}

#[test]
fn test_long_text_column_streams_through_small_floor() {
    let (_memory, conn) = memory("long;ColumnFloor=16");
    conn.just_execute("CREATE TABLE docs (body TEXT)").unwrap();
    let body = "0123456789".repeat(30);
    conn.just_execute(&format!("INSERT INTO docs VALUES ('{}')", body))
        .unwrap();
    let result = conn.execute("SELECT body FROM docs").unwrap();
    assert!(result.next().unwrap());
    assert_eq!(result.get::<String>(0).unwrap(), body);
    // A second read of the same cell starts from the beginning again.
    assert_eq!(result.get::<String>(0).unwrap(), body);
}

#[test]
fn test_bulk_insert_with_null_indicators() {
    let (memory, conn) = memory("bulk");
    conn.just_execute("CREATE TABLE t (id INT, name VARCHAR(16))").unwrap();
    let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?, ?)").unwrap();
    let ids: Vec<i32> = (1..=6).collect();
    let names = ["one", "two", "three", "four", "five", "six"];
    let nulls = [false, true, false, false, true, false];
    stmt.bind_array(0, &ids).unwrap();
    stmt.bind_with(1, &names, Some(&nulls), ParamDirection::Input)
        .unwrap();
    let inserted = stmt.execute().unwrap();
    assert_eq!(inserted.affected_rows().unwrap(), 6);
    assert_eq!(memory.table_rows("t"), Some(6));

    let result = conn.execute("SELECT id, name FROM t ORDER BY id").unwrap();
    let mut seen = Vec::new();
    while result.next().unwrap() {
        seen.push((
            result.get::<i32>(0).unwrap(),
            result.get_or(1, String::from("<null>")).unwrap(),
        ));
    }
    assert_eq!(
        seen,
        vec![
            (1, "one".to_string()),
            (2, "<null>".to_string()),
            (3, "three".to_string()),
            (4, "four".to_string()),
            (5, "<null>".to_string()),
            (6, "six".to_string()),
        ]
    );
}

#[test]
fn test_bulk_strings_and_bytes() {
    let (_memory, conn) = memory("bulk_bytes");
    conn.just_execute("CREATE TABLE t (name VARCHAR(8), raw VARBINARY(8))")
        .unwrap();
    let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?, ?)").unwrap();
    stmt.bind_strings(0, &["a", "bb", "ccc"]).unwrap();
    stmt.bind_bytes(1, &[&[1u8][..], &[2, 2], &[3, 3, 3]]).unwrap();
    stmt.just_execute().unwrap();

    let result = conn.execute("SELECT name, raw FROM t WHERE name = 'bb'").unwrap();
    assert!(result.next().unwrap());
    assert_eq!(result.get::<Vec<u8>>(1).unwrap(), vec![2, 2]);
}

#[test]
fn test_prepared_select_with_parameter() {
    let (_memory, conn) = memory("prepared_select");
    conn.just_execute("CREATE TABLE t (id INT, name VARCHAR(8))").unwrap();
    conn.just_execute("INSERT INTO t VALUES (1, 'a'), (2, 'b')").unwrap();
    let stmt = Statement::with_query(&conn, "SELECT name FROM t WHERE id = ?").unwrap();
    assert_eq!(stmt.parameters().unwrap(), 1);
    for (id, expected) in [(1i32, "a"), (2, "b")] {
        stmt.bind(0, &id).unwrap();
        let result = stmt.execute().unwrap();
        assert!(result.next().unwrap());
        assert_eq!(result.get::<String>(0).unwrap(), expected);
    }
}

#[test]
fn test_stored_procedure_parameters() {
    let (memory, conn) = memory("procedures");
    memory.register_procedure("split_total", |args| {
        let total = match &args[0] {
            odbc_access::driver::memory::Value::Int(v) => *v,
            _ => 0,
        };
        args[1] = odbc_access::driver::memory::Value::Int(total / 2);
        Some(odbc_access::driver::memory::Value::Int(total % 2))
    });

    let stmt = Statement::with_query(&conn, "{? = CALL split_total(?, ?)}").unwrap();
    stmt.bind_output::<i32>(0, ParamDirection::Return, 0).unwrap();
    stmt.bind(1, &9i64).unwrap();
    stmt.bind_output::<i64>(2, ParamDirection::Output, 0).unwrap();
    stmt.just_execute().unwrap();
    assert_eq!(stmt.output::<i32>(0).unwrap(), 1);
    assert_eq!(stmt.output::<i64>(2).unwrap(), 4);
    assert!(matches!(stmt.output::<i32>(3), Err(OdbcError::IndexRange(_))));
}

#[test]
fn test_multi_result_batch() {
    let (_memory, conn) = memory("multi");
    let result = conn
        .execute(
            "CREATE TABLE t (id INT); INSERT INTO t VALUES (1), (2); \
             SELECT COUNT(*) AS total FROM t",
        )
        .unwrap();
    assert_eq!(result.columns().unwrap(), 0);
    assert!(result.next_result().unwrap());
    assert_eq!(result.affected_rows().unwrap(), 2);
    assert!(result.next_result().unwrap());
    assert_eq!(result.column_name(0).unwrap(), "total");
    assert!(result.next().unwrap());
    assert_eq!(result.get_by_name::<i64>("total").unwrap(), 2);
    assert!(!result.next_result().unwrap());
}

#[test]
fn test_scrolling_with_rowsets() {
    let (_memory, conn) = memory("scrolling");
    conn.just_execute("CREATE TABLE t (id INT)").unwrap();
    let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?)").unwrap();
    stmt.bind_array(0, &(0..25).collect::<Vec<i32>>()).unwrap();
    stmt.just_execute().unwrap();

    let query = Statement::with_connection(&conn).unwrap();
    query.set_rowset_size(10).unwrap();
    let result = query
        .execute_direct(&conn, "SELECT id FROM t ORDER BY id")
        .unwrap();
    assert_eq!(result.rowset_size().unwrap(), 10);
    assert!(result.next().unwrap());
    assert_eq!(result.rows().unwrap(), 10);
    assert!(result.last().unwrap());
    assert_eq!(result.get::<i32>(0).unwrap(), 24);
    assert!(result.move_to(12).unwrap());
    assert_eq!(result.get::<i32>(0).unwrap(), 12);
    assert!(result.skip(-12).unwrap());
    assert_eq!(result.position().unwrap(), 0);
    assert!(!result.skip(-1).unwrap());
    assert!(result.end());
    assert!(result.first().unwrap());
    assert_eq!(result.get::<i32>(0).unwrap(), 0);
    assert!(!result.skip(40).unwrap());
    assert!(result.end());
}

#[test]
fn test_reexecute_invalidates_previous_result() {
    let (_memory, conn) = memory("invalidate");
    conn.just_execute("CREATE TABLE t (id INT)").unwrap();
    conn.just_execute("INSERT INTO t VALUES (1), (2)").unwrap();
    let stmt = Statement::with_query(&conn, "SELECT id FROM t").unwrap();
    let stale = stmt.execute().unwrap();
    assert!(stale.next().unwrap());
    let alias = stmt.clone();
    let fresh = alias.execute().unwrap();
    assert!(matches!(stale.get::<i32>(0), Err(OdbcError::Programming(_))));
    assert!(fresh.next().unwrap());
    assert_eq!(fresh.get::<i32>(0).unwrap(), 1);
}

#[test]
fn test_column_metadata() {
    let (_memory, conn) = memory("metadata");
    conn.just_execute("CREATE TABLE t (id BIGINT, label VARCHAR(12), body TEXT)")
        .unwrap();
    let result = conn.execute("SELECT id, label, body FROM t").unwrap();
    assert_eq!(result.columns().unwrap(), 3);
    assert_eq!(result.column_datatype(0).unwrap(), SqlType::BigInt);
    assert_eq!(result.column_size(1).unwrap(), 12);
    assert_eq!(result.column("body").unwrap(), 2);
    assert!(!result.next().unwrap());
    assert!(result.end());
}

#[test]
fn test_misuse_is_programming_error() {
    let (_memory, conn) = memory("misuse");
    let unopened = Statement::new();
    assert!(matches!(unopened.prepare("SELECT 1"), Err(OdbcError::Programming(_))));
    assert!(matches!(unopened.execute(), Err(OdbcError::Programming(_))));
    assert!(matches!(unopened.parameters(), Err(OdbcError::Programming(_))));

    let opened = Statement::with_connection(&conn).unwrap();
    assert!(matches!(opened.execute(), Err(OdbcError::Programming(_))));
    assert!(matches!(opened.bind(0, &1i32), Err(OdbcError::Programming(_))));
}

#[test]
fn test_scrolling_on_driver_without_row_numbers() {
    let (memory, conn) = memory("no_row_numbers");
    memory.set_row_numbers(false);
    conn.just_execute("CREATE TABLE t (id INT)").unwrap();
    let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?)").unwrap();
    stmt.bind_array(0, &(0..25).collect::<Vec<i32>>()).unwrap();
    stmt.just_execute().unwrap();

    let query = Statement::with_connection(&conn).unwrap();
    query.set_rowset_size(10).unwrap();
    let result = query
        .execute_direct(&conn, "SELECT id FROM t ORDER BY id")
        .unwrap();
    assert!(result.last().unwrap());
    assert_eq!(result.position().unwrap(), 24);
    assert_eq!(result.get::<i32>(0).unwrap(), 24);
    assert!(result.skip(-20).unwrap());
    assert_eq!(result.get::<i32>(0).unwrap(), 4);
    assert!(result.move_to(12).unwrap());
    assert_eq!(result.position().unwrap(), 12);
    assert_eq!(result.get::<i32>(0).unwrap(), 12);
}

#[test]
fn test_rebinding_after_close() {
    let (memory, conn) = memory("rebind_after_close");
    conn.just_execute("CREATE TABLE t (id INT, name VARCHAR(8))")
        .unwrap();
    let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?, ?)").unwrap();
    stmt.bind(0, &1i32).unwrap();
    stmt.bind(1, "one").unwrap();
    stmt.just_execute().unwrap();
    stmt.close().unwrap();
    assert_eq!(memory.param_resets(), 1);

    stmt.prepare_on(&conn, "INSERT INTO t VALUES (?, ?)").unwrap();
    stmt.bind(0, &2i32).unwrap();
    stmt.bind(1, "two").unwrap();
    stmt.just_execute().unwrap();
    let result = conn.execute("SELECT name FROM t ORDER BY id").unwrap();
    assert!(result.last().unwrap());
    assert_eq!(result.get::<String>(0).unwrap(), "two");
}

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use odbc_access::test_helpers::memory_connection;
use odbc_access::{Connection, Statement};

const ROWS: i32 = 2_000;

fn populated() -> Connection {
    let (_memory, conn) = memory_connection("bench").expect("memory connection");
    conn.just_execute("CREATE TABLE users (id INT, name VARCHAR(32), score DOUBLE)")
        .expect("create table");
    let stmt = Statement::with_query(&conn, "INSERT INTO users VALUES (?, ?, ?)")
        .expect("prepare insert");
    let ids: Vec<i32> = (0..ROWS).collect();
    let names: Vec<String> = ids.iter().map(|i| format!("user_{}", i)).collect();
    let scores: Vec<f64> = ids.iter().map(|i| f64::from(*i) * 0.5).collect();
    stmt.bind_array(0, &ids).expect("bind ids");
    stmt.bind_array(1, &names).expect("bind names");
    stmt.bind_array(2, &scores).expect("bind scores");
    stmt.just_execute().expect("bulk insert");
    conn
}

fn benchmark_fetch_by_rowset_size(c: &mut Criterion) {
    let conn = populated();
    let mut group = c.benchmark_group("fetch_2000_rows");
    for rowset in [1usize, 16, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(rowset), &rowset, |b, &rowset| {
            b.iter(|| {
                let stmt = Statement::with_connection(&conn).expect("open");
                stmt.set_rowset_size(rowset).expect("rowset size");
                let result = stmt
                    .execute_direct(&conn, "SELECT id, name, score FROM users")
                    .expect("select");
                let mut total = 0i64;
                while result.next().expect("next") {
                    total += result.get::<i64>(0).expect("id");
                    black_box(result.get::<String>(1).expect("name"));
                }
                black_box(total)
            });
        });
    }
    group.finish();
}

fn benchmark_bulk_insert(c: &mut Criterion) {
    c.bench_function("bulk_insert_1000_rows", |b| {
        let (_memory, conn) = memory_connection("bulk").expect("memory connection");
        conn.just_execute("CREATE TABLE t (id INT, name VARCHAR(16))")
            .expect("create table");
        let ids: Vec<i32> = (0..1000).collect();
        let names: Vec<String> = ids.iter().map(|i| format!("n{}", i)).collect();
        let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?, ?)")
            .expect("prepare insert");
        b.iter(|| {
            stmt.bind_array(0, black_box(&ids)).expect("bind ids");
            stmt.bind_array(1, black_box(&names)).expect("bind names");
            stmt.just_execute().expect("insert");
        });
    });
}

criterion_group!(benches, benchmark_fetch_by_rowset_size, benchmark_bulk_insert);
criterion_main!(benches);

use serde_json::{json, Value};

use docql::Database;

async fn memory_db() -> Database {
  Database::connect("doc://memory").await.unwrap()
}

async fn seed_users(db: &Database) {
  db.execute_raw(
    "INSERT INTO users (name, age, email) VALUES \
     ('Ada', 36, 'ada@example.com'), \
     ('Grace', 46, NULL), \
     ('Alan', 41, 'alan@example.com')",
    &[],
  )
  .await
  .unwrap();
}

#[tokio::test]
async fn simple_where_filters_documents() {
  let db = memory_db().await;
  seed_users(&db).await;

  let rows: Vec<Value> = db
    .query_raw("SELECT * FROM users WHERE age > 40", &[])
    .await
    .unwrap();
  assert_eq!(rows.len(), 2);
  assert!(rows.iter().all(|r| r["age"].as_i64().unwrap() > 40));
}

#[tokio::test]
async fn raw_results_keep_column_names() {
  let db = memory_db().await;
  db.execute_raw("INSERT INTO users (id, name) VALUES (7, 'Ada')", &[])
    .await
    .unwrap();

  let rows: Vec<Value> = db.query_raw("SELECT * FROM users", &[]).await.unwrap();
  // Raw SQL callers see storage names, `_id` included.
  assert_eq!(rows[0]["_id"], json!(7));
  assert!(rows[0].get("id").is_none());
}

#[tokio::test]
async fn positional_parameters() {
  let db = memory_db().await;
  seed_users(&db).await;

  let rows: Vec<Value> = db
    .query_raw(
      "SELECT * FROM users WHERE age > ? AND name = ?",
      &[json!(30), json!("Grace")],
    )
    .await
    .unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0]["name"], json!("Grace"));
}

#[tokio::test]
async fn join_group_having_end_to_end() {
  let db = memory_db().await;
  db.execute_raw("INSERT INTO users (id, name) VALUES (1, 'Ada'), (2, 'Grace')", &[])
    .await
    .unwrap();
  db.execute_raw(
    "INSERT INTO orders (id, user_id, total) VALUES \
     (1, 1, 10), (2, 1, 20), (3, 1, 30), (4, 2, 5)",
    &[],
  )
  .await
  .unwrap();

  let rows: Vec<Value> = db
    .query_raw(
      "SELECT u.name, COUNT(*) AS c FROM users u \
       LEFT JOIN orders o ON o.user_id = u.id \
       GROUP BY u.name HAVING c >= 3",
      &[],
    )
    .await
    .unwrap();

  assert_eq!(rows, vec![json!({"name": "Ada", "c": 3})]);
}

#[tokio::test]
async fn in_subquery_resolves_against_engine() {
  let db = memory_db().await;
  db.execute_raw(
    "INSERT INTO posts (id, title) VALUES (1, 'first'), (2, 'second'), (3, 'third')",
    &[],
  )
  .await
  .unwrap();
  db.execute_raw(
    "INSERT INTO likes (id, post_id, user_id) VALUES \
     (1, 1, 42), (2, 3, 42), (3, 2, 7), (4, 1, 42)",
    &[],
  )
  .await
  .unwrap();

  let rows: Vec<Value> = db
    .query_raw(
      "SELECT * FROM posts WHERE id IN (SELECT post_id FROM likes WHERE user_id = ?)",
      &[json!(42)],
    )
    .await
    .unwrap();

  let mut ids: Vec<i64> = rows.iter().map(|r| r["_id"].as_i64().unwrap()).collect();
  ids.sort();
  assert_eq!(ids, vec![1, 3]);
}

#[tokio::test]
async fn not_in_subquery() {
  let db = memory_db().await;
  db.execute_raw("INSERT INTO posts (id, title) VALUES (1, 'a'), (2, 'b')", &[])
    .await
    .unwrap();
  db.execute_raw("INSERT INTO likes (id, post_id) VALUES (1, 1)", &[])
    .await
    .unwrap();

  let rows: Vec<Value> = db
    .query_raw(
      "SELECT * FROM posts WHERE id NOT IN (SELECT post_id FROM likes)",
      &[],
    )
    .await
    .unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0]["_id"], json!(2));
}

#[tokio::test]
async fn limit_zero_returns_nothing() {
  let db = memory_db().await;
  seed_users(&db).await;

  let rows: Vec<Value> = db.query_raw("SELECT * FROM users LIMIT 0", &[]).await.unwrap();
  assert!(rows.is_empty());
}

#[tokio::test]
async fn like_wildcard_matches_length_one_or_more() {
  let db = memory_db().await;
  db.execute_raw("INSERT INTO words (id, text) VALUES (1, ''), (2, 'a'), (3, 'abc')", &[])
    .await
    .unwrap();

  let rows: Vec<Value> = db
    .query_raw("SELECT * FROM words WHERE text LIKE '%_'", &[])
    .await
    .unwrap();
  assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn like_is_case_insensitive() {
  let db = memory_db().await;
  seed_users(&db).await;

  let rows: Vec<Value> = db
    .query_raw("SELECT * FROM users WHERE name LIKE 'a%'", &[])
    .await
    .unwrap();
  // Ada and Alan, case-insensitively.
  assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn count_star_versus_count_field() {
  let db = memory_db().await;
  seed_users(&db).await;

  let all: i64 = db.query_raw_one("SELECT COUNT(*) AS n FROM users", &[]).await.unwrap();
  assert_eq!(all, 3);

  // Grace's NULL email is excluded.
  let with_email: i64 = db
    .query_raw_one("SELECT COUNT(email) AS n FROM users", &[])
    .await
    .unwrap();
  assert_eq!(with_email, 2);
}

#[tokio::test]
async fn aggregate_functions() {
  let db = memory_db().await;
  seed_users(&db).await;

  let rows: Vec<Value> = db
    .query_raw("SELECT AVG(age) AS avg_age, MIN(age) AS lo, MAX(age) AS hi FROM users", &[])
    .await
    .unwrap();
  assert_eq!(rows[0]["lo"], json!(36));
  assert_eq!(rows[0]["hi"], json!(46));
  assert_eq!(rows[0]["avg_age"], json!(41.0));
}

#[tokio::test]
async fn update_without_where_touches_all() {
  let db = memory_db().await;
  seed_users(&db).await;

  let result = db.execute_raw("UPDATE users SET active = true", &[]).await.unwrap();
  assert_eq!(result.rows_affected, 3);
}

#[tokio::test]
async fn delete_without_where_removes_all() {
  let db = memory_db().await;
  seed_users(&db).await;

  let result = db.execute_raw("DELETE FROM users", &[]).await.unwrap();
  assert_eq!(result.rows_affected, 3);

  let count: i64 = db.query_raw_one("SELECT COUNT(*) AS n FROM users", &[]).await.unwrap();
  assert_eq!(count, 0);
}

#[tokio::test]
async fn between_and_is_null() {
  let db = memory_db().await;
  seed_users(&db).await;

  let rows: Vec<Value> = db
    .query_raw("SELECT * FROM users WHERE age BETWEEN 40 AND 46", &[])
    .await
    .unwrap();
  assert_eq!(rows.len(), 2);

  let rows: Vec<Value> = db
    .query_raw("SELECT * FROM users WHERE email IS NULL", &[])
    .await
    .unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0]["name"], json!("Grace"));
}

#[tokio::test]
async fn order_by_with_offset() {
  let db = memory_db().await;
  seed_users(&db).await;

  let rows: Vec<Value> = db
    .query_raw("SELECT name FROM users ORDER BY age DESC LIMIT 2 OFFSET 1", &[])
    .await
    .unwrap();
  let names: Vec<&str> = rows.iter().map(|r| r["name"].as_str().unwrap()).collect();
  assert_eq!(names, ["Alan", "Ada"]);
}

#[tokio::test]
async fn distinct_values() {
  let db = memory_db().await;
  db.execute_raw(
    "INSERT INTO events (id, kind) VALUES (1, 'click'), (2, 'view'), (3, 'click')",
    &[],
  )
  .await
  .unwrap();

  let rows: Vec<Value> = db.query_raw("SELECT DISTINCT kind FROM events", &[]).await.unwrap();
  assert_eq!(rows.len(), 2);
}

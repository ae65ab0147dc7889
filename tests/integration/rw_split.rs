//! End-to-end read/write splitting through the proxy.

use mysql::prelude::Queryable;

use super::proxy::spawn_proxy;
use super::{get_mysql_config, should_run_integration_tests};

#[tokio::test(flavor = "multi_thread")]
async fn test_select_through_proxy() {
    if !should_run_integration_tests() {
        return;
    }
    let config = get_mysql_config();
    let port = spawn_proxy(&config, "readwritesplit").await;
    let url = config.proxy_url(port);

    let rows: Vec<i64> = tokio::task::spawn_blocking(move || {
        let pool = mysql::Pool::new(url.as_str()).expect("connect through proxy");
        let mut conn = pool.get_conn().expect("get conn");
        conn.query("SELECT 1").expect("select")
    })
    .await
    .expect("join");

    assert_eq!(rows, vec![1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_write_and_read_back() {
    if !should_run_integration_tests() {
        return;
    }
    let config = get_mysql_config();
    let port = spawn_proxy(&config, "readwritesplit").await;
    let url = config.proxy_url(port);

    let count: i64 = tokio::task::spawn_blocking(move || {
        let pool = mysql::Pool::new(url.as_str()).expect("connect through proxy");
        let mut conn = pool.get_conn().expect("get conn");
        conn.query_drop("CREATE TABLE IF NOT EXISTS bifrost_it (id INT PRIMARY KEY, c INT)")
            .expect("create");
        conn.query_drop("DELETE FROM bifrost_it").expect("clear");
        conn.query_drop("INSERT INTO bifrost_it VALUES (1, 10), (2, 20)")
            .expect("insert");
        let count: Option<i64> = conn
            .query_first("SELECT COUNT(*) FROM bifrost_it")
            .expect("count");
        conn.query_drop("DROP TABLE bifrost_it").expect("drop");
        count.unwrap_or(0)
    })
    .await
    .expect("join");

    assert_eq!(count, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_variables_survive() {
    if !should_run_integration_tests() {
        return;
    }
    let config = get_mysql_config();
    let port = spawn_proxy(&config, "readwritesplit").await;
    let url = config.proxy_url(port);

    let value: Option<i64> = tokio::task::spawn_blocking(move || {
        let pool = mysql::Pool::new(url.as_str()).expect("connect through proxy");
        let mut conn = pool.get_conn().expect("get conn");
        // A session command followed by a read that depends on it
        conn.query_drop("SET @probe = 42").expect("set");
        conn.query_first("SELECT @probe").expect("read back")
    })
    .await
    .expect("join");

    assert_eq!(value, Some(42));
}

//! Atomic right-pop / left-push moves between lists.
//!
//! Every package transition in the protocol is one of these two single
//! server-side operations; this is what keeps the input/working/failed
//! union intact under concurrent producers, consumers, and crashes.

use redis::aio::MultiplexedConnection;

pub(crate) async fn move_rightmost(
    conn: &mut MultiplexedConnection,
    src: &str,
    dst: &str,
) -> redis::RedisResult<Option<String>> {
    redis::cmd("RPOPLPUSH").arg(src).arg(dst).query_async(conn).await
}

/// Blocking variant; a zero timeout waits until `src` has an element.
pub(crate) async fn blocking_move_rightmost(
    conn: &mut MultiplexedConnection,
    src: &str,
    dst: &str,
) -> redis::RedisResult<Option<String>> {
    redis::cmd("BRPOPLPUSH")
        .arg(src)
        .arg(dst)
        .arg(0)
        .query_async(conn)
        .await
}

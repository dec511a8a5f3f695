//! Row set sub-protocol, after `RowDescription`.
use tokio::io::{AsyncRead, AsyncWrite};

use super::result::{QueryResult, ResultStatus};
use crate::{
    Result,
    common::verbose,
    postgres::{
        ProtocolError, ServerError, ServerVersion,
        backend::{self, NotificationResponse},
    },
    row::{Column, Row},
    stream::PgStream,
};

/// How a row set ended.
#[derive(Debug)]
pub(crate) enum RowSetEnd {
    /// `CommandComplete` with its tag.
    Complete(String),
    /// Server error in the middle of the row set.
    Error(ServerError),
}

/// Read row description, rows, and the closing message into `node`.
pub(crate) async fn read_row_set<S>(
    io: &mut PgStream<S>,
    version: ServerVersion,
    node: &mut QueryResult,
) -> Result<RowSetEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = io.get_i16().await?.max(0) as usize;
    let mut columns = Vec::with_capacity(len);
    for _ in 0..len {
        columns.push(Column {
            name: io.get_string().await?,
            type_oid: io.get_i32().await?,
            type_len: io.get_i16().await?,
            type_modifier: if version.at_least(6, 4) { io.get_i32().await? } else { -1 },
        });
    }
    node.columns = columns;
    node.status = ResultStatus::TuplesOk;

    loop {
        let msgtype = io.get_u8().await?;
        match msgtype {
            backend::ASCII_ROW => node.rows.push(read_row(io, len, true).await?),
            backend::BINARY_ROW => node.rows.push(read_row(io, len, false).await?),
            backend::COMMAND_COMPLETE => return Ok(RowSetEnd::Complete(io.get_string().await?)),
            backend::NOTICE_RESPONSE => node.notices.push(io.get_string().await?),
            backend::ERROR_RESPONSE => return Ok(RowSetEnd::Error(backend::read_error(io).await?)),
            NotificationResponse::MSGTYPE => {
                let _notify = NotificationResponse::read(io).await?;
                verbose!(?_notify, "notification ignored");
            }
            f => return Err(ProtocolError::unexpected(f, "row set").into()),
        }
    }
}

/// Null bitmap, then each non-null value prefixed with its length.
///
/// Length of a text value counts the length word itself.
async fn read_row<S>(io: &mut PgStream<S>, len: usize, text: bool) -> Result<Row>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bitmap = io.get_bytes(len.div_ceil(8)).await?;
    let mut values = Vec::with_capacity(len);
    for i in 0..len {
        if bitmap[i / 8] & (0x80 >> (i % 8)) == 0 {
            values.push(None);
            continue;
        }
        let mut size = io.get_i32().await?;
        if text {
            size -= 4;
        }
        values.push(Some(io.get_bytes(size.max(0) as usize).await?));
    }
    Ok(Row::new(values))
}

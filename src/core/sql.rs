//! SQLite 辅助：LIKE 模式与 Unicode 小写函数

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

/// 在连接上注册 `unicode_lower(text)`；SQLite 自带的 lower() 只处理 ASCII
pub(crate) fn register_unicode_lower(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "unicode_lower",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text: Option<String> = ctx.get(0)?;
            Ok(text.map(|t| t.to_lowercase()))
        },
    )
}

/// 大小写无关的包含匹配模式：先转小写，再转义 % _ \ 并两侧加 %。
/// 配合 `unicode_lower(col) LIKE ?n ESCAPE '\'` 使用。
pub(crate) fn contains_pattern(query: &str) -> String {
    let query = query.to_lowercase();
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

use serde::Serialize;

const FENCE: &str = "```";

/**
 * \brief 模型回复中的一个渲染片段。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Span<'a> {
    Text { text: &'a str },
    Link { url: &'a str },
    InlineCode { code: &'a str },
    CodeBlock { lang: Option<&'a str>, code: &'a str },
}

/**
 * \brief 惰性分词器；克隆即可从当前位置重新遍历。
 */
#[derive(Debug, Clone)]
pub struct Tokens<'a> {
    rest: &'a str,
}

/**
 * \brief 将模型回复切分为文本、链接、行内代码、代码块。
 */
pub fn tokenize(content: &str) -> Tokens<'_> {
    Tokens { rest: content }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Span<'a>;

    fn next(&mut self) -> Option<Span<'a>> {
        if self.rest.is_empty() {
            return None;
        }
        if let Some((span, used)) = special_at(self.rest) {
            self.rest = &self.rest[used..];
            return Some(span);
        }
        let end = next_special(self.rest).unwrap_or(self.rest.len());
        let (text, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(Span::Text { text })
    }
}

/** \brief 从 1 开始寻找下一个能解析为特殊片段的位置。 */
fn next_special(s: &str) -> Option<usize> {
    s.char_indices()
        .skip(1)
        .map(|(i, _)| i)
        .filter(|&i| matches!(s.as_bytes()[i], b'`' | b'h'))
        .find(|&i| special_at(&s[i..]).is_some())
}

fn special_at(s: &str) -> Option<(Span<'_>, usize)> {
    if s.starts_with(FENCE) {
        if let Some(found) = code_block(s) {
            return Some(found);
        }
    }
    if s.starts_with('`') {
        return inline_code(s);
    }
    link(s)
}

/** \brief ```lang\n ... ``` ，语言标签可选，正文去除首尾空白。 */
fn code_block(s: &str) -> Option<(Span<'_>, usize)> {
    let after_fence = &s[FENCE.len()..];
    let lang_len = after_fence
        .char_indices()
        .find(|&(_, c)| !(c.is_alphanumeric() || c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(after_fence.len());
    let (lang, tail) = after_fence.split_at(lang_len);
    let body = tail.strip_prefix('\n')?;
    let close = body.find(FENCE)?;
    let used = s.len() - body.len() + close + FENCE.len();
    let lang = if lang.is_empty() { None } else { Some(lang) };
    Some((
        Span::CodeBlock {
            lang,
            code: body[..close].trim(),
        },
        used,
    ))
}

fn inline_code(s: &str) -> Option<(Span<'_>, usize)> {
    let body = &s[1..];
    let close = body.find('`')?;
    if close == 0 {
        return None;
    }
    Some((
        Span::InlineCode {
            code: &body[..close],
        },
        close + 2,
    ))
}

fn link(s: &str) -> Option<(Span<'_>, usize)> {
    let scheme = if s.starts_with("https://") {
        "https://".len()
    } else if s.starts_with("http://") {
        "http://".len()
    } else {
        return None;
    };
    let end = s
        .char_indices()
        .skip_while(|&(i, _)| i < scheme)
        .find(|&(_, c)| c.is_whitespace() || c == '`')
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if end == scheme {
        return None;
    }
    Some((Span::Link { url: &s[..end] }, end))
}

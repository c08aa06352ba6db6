use crate::core::error::{Error, Result};
use crate::core::model::MarkupElementRecord;
use crate::indexing::extract::{mask_ranges, retain_valid, MarkupExtractor, SourceFile};
use regex::Regex;

/// Statement tags that bind a logical id
pub const STATEMENT_TAGS: [&str; 4] = ["select", "insert", "update", "delete"];

/// Tag kind of the root record, whose logical id is the namespace itself
pub const MAPPER_TAG: &str = "mapper";

/// Extracts the mapper namespace and statement ids from MyBatis mapper XML
pub struct MapperXmlExtractor {
    mapper_open: Regex,
    statement_open: Regex,
    attribute: Regex,
}

impl MapperXmlExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            mapper_open: Regex::new(r"<mapper\b[^>]*>")?,
            statement_open: Regex::new(&format!(r"<({})\b[^>]*>", STATEMENT_TAGS.join("|")))?,
            attribute: Regex::new(r#"([\w:.-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)?,
        })
    }

    fn attribute<'a>(&self, tag: &'a str, name: &str) -> Option<&'a str> {
        self.attribute.captures_iter(tag).find_map(|caps| {
            if &caps[1] != name {
                return None;
            }
            caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str().trim())
        })
    }
}

/// Byte ranges of comments and CDATA sections, which never hold statements
fn opaque_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut pos = 0;
    while pos < text.len() {
        let rest = &text[pos..];
        let next = [("<!--", "-->"), ("<![CDATA[", "]]>")]
            .iter()
            .filter_map(|(open, close)| rest.find(open).map(|at| (at, *open, *close)))
            .min_by_key(|(at, _, _)| *at);
        let Some((at, open, close)) = next else {
            break;
        };
        let start = pos + at;
        let body = start + open.len();
        let end = text[body..]
            .find(close)
            .map(|i| body + i + close.len())
            .unwrap_or(text.len());
        ranges.push((start, end));
        pos = end;
    }
    ranges
}

impl MarkupExtractor for MapperXmlExtractor {
    fn extract_markup(&self, file: &SourceFile) -> Result<Vec<MarkupElementRecord>> {
        let masked = mask_ranges(&file.text, &opaque_ranges(&file.text), b' ');

        let Some(mapper) = self.mapper_open.find(&masked) else {
            return Ok(Vec::new());
        };
        let namespace = self
            .attribute(mapper.as_str(), "namespace")
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| {
                Error::Extraction(format!("{}: <mapper> without a namespace", file.path))
            })?;

        let mut records = vec![MarkupElementRecord::new(
            &file.path,
            mapper.start(),
            mapper.end(),
            MAPPER_TAG,
            namespace,
            "",
        )];

        for caps in self.statement_open.captures_iter(&masked[mapper.end()..]) {
            let (Some(open), Some(tag)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let Some(id) = self.attribute(open.as_str(), "id").filter(|id| !id.is_empty()) else {
                tracing::debug!(path = %file.path, tag = tag.as_str(), "statement without id");
                continue;
            };
            let variant = self.attribute(open.as_str(), "databaseId").unwrap_or_default();

            let start = mapper.end() + open.start();
            let open_end = mapper.end() + open.end();
            let end = if open.as_str().ends_with("/>") {
                open_end
            } else {
                let close = format!("</{}>", tag.as_str());
                masked[open_end..]
                    .find(&close)
                    .map(|i| open_end + i + close.len())
                    .unwrap_or(open_end)
            };

            records.push(MarkupElementRecord::new(
                &file.path,
                start,
                end,
                tag.as_str(),
                format!("{}.{}", namespace, id),
                variant,
            ));
        }

        Ok(retain_valid(file, records, MarkupElementRecord::validate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER_MAPPER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE mapper PUBLIC "-//mybatis.org//DTD Mapper 3.0//EN" "http://mybatis.org/dtd/mybatis-3-mapper.dtd">
<mapper namespace="com.x.UserMapper">
    <!-- <select id="commentedOut">select 1</select> -->
    <select id="findById" resultType="User">
        select * from users where id = #{id}
    </select>
    <select id="findById" databaseId="oracle">
        <![CDATA[ select * from users where id < #{id} <delete id="notReal"> ]]>
    </select>
    <insert id='insertUser' parameterType="User">
        insert into users values (#{id})
    </insert>
    <update id="touch"/>
</mapper>
"#;

    fn extract(text: &str) -> Vec<MarkupElementRecord> {
        let file = SourceFile::from_text("res/UserMapper.xml", text);
        MapperXmlExtractor::new().unwrap().extract_markup(&file).unwrap()
    }

    #[test]
    fn test_extracts_namespace_and_statements() {
        let records = extract(USER_MAPPER);
        let ids: Vec<(&str, &str, &str)> = records
            .iter()
            .map(|r| (r.tag_kind.as_str(), r.logical_id.as_str(), r.variant.as_str()))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("mapper", "com.x.UserMapper", ""),
                ("select", "com.x.UserMapper.findById", ""),
                ("select", "com.x.UserMapper.findById", "oracle"),
                ("insert", "com.x.UserMapper.insertUser", ""),
                ("update", "com.x.UserMapper.touch", ""),
            ]
        );
    }

    #[test]
    fn test_statement_span_covers_element() {
        let records = extract(USER_MAPPER);
        let select = &records[1];
        let slice = &USER_MAPPER[select.start_offset..select.end_offset];
        assert!(slice.starts_with("<select id=\"findById\""));
        assert!(slice.ends_with("</select>"));
        for record in &records {
            assert!(record.start_offset < record.end_offset);
            assert!(record.end_offset <= USER_MAPPER.len());
        }
    }

    #[test]
    fn test_non_mapper_xml_has_no_records() {
        assert!(extract("<project><modelVersion>4.0.0</modelVersion></project>").is_empty());
        assert!(extract("").is_empty());
    }

    #[test]
    fn test_mapper_without_namespace_fails() {
        let file = SourceFile::from_text("M.xml", "<mapper><select id=\"a\"/></mapper>");
        assert!(MapperXmlExtractor::new().unwrap().extract_markup(&file).is_err());
    }

    #[test]
    fn test_opaque_ranges() {
        let text = "a<!-- x -->b<![CDATA[ y ]]>c<!-- open";
        let ranges = opaque_ranges(text);
        assert_eq!(ranges.len(), 3);
        assert_eq!(&text[ranges[0].0..ranges[0].1], "<!-- x -->");
        assert_eq!(&text[ranges[1].0..ranges[1].1], "<![CDATA[ y ]]>");
        assert_eq!(ranges[2].1, text.len());
    }
}

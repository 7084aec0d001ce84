//! XMLTV parser (C9 step 5). Event-based with `quick-xml`: attributes are
//! read straight off each `<channel>`/`<programme>` start tag and merged
//! with their element's text content, and repeated elements like
//! `<display-name>`/`<category>` just keep appending, so an
//! arrays-of-one feed and an arrays-of-many feed parse identically.

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{EpgChannel, EpgProgram};

const MAX_TITLE_LEN: usize = 255;
const MAX_DESC_LEN: usize = 2000;

#[derive(Default)]
struct ChannelBuilder {
    id: String,
    display_names: Vec<String>,
    icon: Option<String>,
}

impl ChannelBuilder {
    fn build(self) -> Option<EpgChannel> {
        if self.id.is_empty() {
            return None;
        }
        Some(EpgChannel {
            // Stamped by the caller once the source this feed belongs to
            // is known; the parser itself is source-agnostic.
            source_id: Uuid::nil(),
            epg_id: self.id,
            display_name: self.display_names.into_iter().next().unwrap_or_default(),
            icon_url: self.icon,
            created_at: Utc::now(),
        })
    }
}

#[derive(Default)]
struct ProgramBuilder {
    channel: String,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    title: Option<String>,
    subtitle: Option<String>,
    description: Option<String>,
    categories: Vec<String>,
    year: Option<i64>,
    country: Option<String>,
    icon: Option<String>,
    pending_episode_system: Option<String>,
    episode_xmltv_ns: Option<String>,
    rating: Option<String>,
    flag_subtitles: bool,
    flag_hd: bool,
    flag_premiere: bool,
    flag_finale: bool,
    flag_live: bool,
    flag_new_episode: bool,
}

impl ProgramBuilder {
    fn build(self) -> Option<EpgProgram> {
        let (start, end) = match (self.start, self.end) {
            (Some(s), Some(e)) if e > s => (s, e),
            _ => return None,
        };
        if self.channel.is_empty() {
            return None;
        }

        let mut title = self.title.unwrap_or_default();
        truncate_at_char_boundary(&mut title, MAX_TITLE_LEN);
        let mut description = self.description;
        if let Some(d) = description.as_mut() {
            truncate_at_char_boundary(d, MAX_DESC_LEN);
        }

        let mut categories = self.categories.into_iter();
        let category = categories.next();
        let secondary_category = categories.next();

        let episode_number = self
            .episode_xmltv_ns
            .as_deref()
            .and_then(parse_xmltv_ns_episode)
            .filter(|n| *n > 0);
        let season_number = self
            .episode_xmltv_ns
            .as_deref()
            .and_then(parse_xmltv_ns_season)
            .filter(|n| *n > 0);

        Some(EpgProgram {
            id: String::new(),
            channel_key: self.channel,
            title,
            subtitle: self.subtitle,
            description,
            start,
            end,
            category,
            secondary_category,
            year: self.year,
            country: self.country,
            icon_url: self.icon,
            episode_number,
            season_number,
            series_id: None,
            keywords: None,
            rating: self.rating,
            flag_audio_description: false,
            flag_subtitles: self.flag_subtitles,
            flag_hd: self.flag_hd,
            flag_premiere: self.flag_premiere,
            flag_finale: self.flag_finale,
            flag_live: self.flag_live,
            flag_new_episode: self.flag_new_episode,
        })
    }
}

fn truncate_at_char_boundary(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut boundary = max_bytes;
    while boundary > 0 && !s.is_char_boundary(boundary) {
        boundary -= 1;
    }
    s.truncate(boundary);
}

fn tag_name(start: &BytesStart) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn attr(start: &BytesStart, key: &str) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key.as_bytes())
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

/// Parses `20260728120000 +0000`-style XMLTV timestamps. A missing
/// offset is treated as UTC.
fn parse_xmltv_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let (datetime_part, offset_part) = match value.split_once(' ') {
        Some((d, o)) => (d, Some(o)),
        None => (value, None),
    };
    if datetime_part.len() < 14 {
        return None;
    }
    let naive = chrono::NaiveDateTime::parse_from_str(&datetime_part[..14], "%Y%m%d%H%M%S").ok()?;
    let offset = offset_part.and_then(parse_offset).unwrap_or(FixedOffset::east_opt(0)?);
    let fixed = offset.from_local_datetime(&naive).single()?;
    Some(fixed.with_timezone(&Utc))
}

fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.len() != 5 {
        return None;
    }
    let sign = match &raw[0..1] {
        "+" => 1,
        "-" => -1,
        _ => return None,
    };
    let hours: i32 = raw[1..3].parse().ok()?;
    let minutes: i32 = raw[3..5].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// `S.E.P/T` xmltv_ns episode numbers are zero-based; callers expect
/// one-based season/episode numbers.
fn parse_xmltv_ns_season(value: &str) -> Option<i64> {
    let part = value.split('.').next()?.trim();
    if part.is_empty() {
        return None;
    }
    part.split('/').next()?.parse::<i64>().ok().map(|n| n + 1)
}

fn parse_xmltv_ns_episode(value: &str) -> Option<i64> {
    let part = value.split('.').nth(1)?.trim();
    if part.is_empty() {
        return None;
    }
    part.split('/').next()?.parse::<i64>().ok().map(|n| n + 1)
}

fn open_tag(name: &str, start: &BytesStart, channel: &mut Option<ChannelBuilder>, program: &mut Option<ProgramBuilder>) {
    match name {
        "channel" => {
            *channel = Some(ChannelBuilder { id: attr(start, "id").unwrap_or_default(), ..Default::default() });
        }
        "programme" => {
            *program = Some(ProgramBuilder {
                channel: attr(start, "channel").unwrap_or_default(),
                start: attr(start, "start").as_deref().and_then(parse_xmltv_time),
                end: attr(start, "stop").as_deref().and_then(parse_xmltv_time),
                ..Default::default()
            });
        }
        "icon" => {
            if let Some(src) = attr(start, "src") {
                if let Some(p) = program.as_mut() {
                    p.icon = Some(src);
                } else if let Some(c) = channel.as_mut() {
                    c.icon = Some(src);
                }
            }
        }
        "episode-num" => {
            if let Some(p) = program.as_mut() {
                p.pending_episode_system = attr(start, "system");
            }
        }
        "new" => {
            if let Some(p) = program.as_mut() {
                p.flag_new_episode = true;
            }
        }
        "live" => {
            if let Some(p) = program.as_mut() {
                p.flag_live = true;
            }
        }
        "premiere" => {
            if let Some(p) = program.as_mut() {
                p.flag_premiere = true;
            }
        }
        "last-chance" => {
            if let Some(p) = program.as_mut() {
                p.flag_finale = true;
            }
        }
        "subtitles" => {
            if let Some(p) = program.as_mut() {
                p.flag_subtitles = true;
            }
        }
        _ => {}
    }
}

#[allow(clippy::too_many_arguments)]
fn close_tag(
    name: &str,
    parent: &str,
    text: &str,
    channel: &mut Option<ChannelBuilder>,
    program: &mut Option<ProgramBuilder>,
    channels: &mut Vec<EpgChannel>,
    programs: &mut Vec<EpgProgram>,
) {
    match name {
        "channel" => {
            if let Some(builder) = channel.take() {
                if let Some(c) = builder.build() {
                    channels.push(c);
                }
            }
        }
        "programme" => {
            if let Some(builder) = program.take() {
                if let Some(p) = builder.build() {
                    programs.push(p);
                }
            }
        }
        "display-name" => {
            if !text.is_empty() {
                if let Some(c) = channel.as_mut() {
                    c.display_names.push(text.to_string());
                }
            }
        }
        "title" => {
            if let Some(p) = program.as_mut() {
                if p.title.is_none() && !text.is_empty() {
                    p.title = Some(text.to_string());
                }
            }
        }
        "sub-title" => {
            if let Some(p) = program.as_mut() {
                if !text.is_empty() {
                    p.subtitle = Some(text.to_string());
                }
            }
        }
        "desc" => {
            if let Some(p) = program.as_mut() {
                if !text.is_empty() {
                    p.description = Some(text.to_string());
                }
            }
        }
        "category" => {
            if let Some(p) = program.as_mut() {
                if !text.is_empty() {
                    p.categories.push(text.to_string());
                }
            }
        }
        "date" => {
            if let Some(p) = program.as_mut() {
                p.year = text.get(0..4).and_then(|y| y.parse().ok());
            }
        }
        "country" => {
            if let Some(p) = program.as_mut() {
                if !text.is_empty() {
                    p.country = Some(text.to_string());
                }
            }
        }
        "episode-num" => {
            if let Some(p) = program.as_mut() {
                if p.pending_episode_system.take().as_deref() == Some("xmltv_ns") && !text.is_empty() {
                    p.episode_xmltv_ns = Some(text.to_string());
                }
            }
        }
        "value" if parent == "rating" => {
            if let Some(p) = program.as_mut() {
                if !text.is_empty() {
                    p.rating = Some(text.to_string());
                }
            }
        }
        "quality" if parent == "video" => {
            if let Some(p) = program.as_mut() {
                if text.to_lowercase().contains("hd") {
                    p.flag_hd = true;
                }
            }
        }
        _ => {}
    }
}

/// Parses a full XMLTV document into its channels and programmes.
pub fn parse(xml: &str) -> Result<(Vec<EpgChannel>, Vec<EpgProgram>), AppError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut channels = Vec::new();
    let mut programs = Vec::new();
    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut channel: Option<ChannelBuilder> = None;
    let mut program: Option<ProgramBuilder> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(start) => {
                let name = tag_name(&start);
                open_tag(&name, &start, &mut channel, &mut program);
                stack.push(name);
                text.clear();
            }
            Event::Empty(start) => {
                let name = tag_name(&start);
                open_tag(&name, &start, &mut channel, &mut program);
                let parent = stack.last().cloned().unwrap_or_default();
                close_tag(&name, &parent, "", &mut channel, &mut program, &mut channels, &mut programs);
            }
            Event::Text(e) => {
                text.push_str(&e.unescape()?);
            }
            Event::CData(e) => {
                text.push_str(&String::from_utf8_lossy(e.as_ref()));
            }
            Event::End(end) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                stack.pop();
                let parent = stack.last().cloned().unwrap_or_default();
                close_tag(&name, &parent, text.trim(), &mut channel, &mut program, &mut channels, &mut programs);
                text.clear();
            }
            _ => {}
        }
        buf.clear();
    }

    Ok((channels, programs))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
    <tv>
      <channel id="bbc1.uk">
        <display-name>BBC One</display-name>
        <icon src="http://example.com/bbc1.png"/>
      </channel>
      <programme start="20260728120000 +0000" stop="20260728130000 +0000" channel="bbc1.uk">
        <title>Evening News</title>
        <desc>The day's headlines.</desc>
        <category>News</category>
        <category>Politics</category>
        <episode-num system="xmltv_ns">0.4.0/1</episode-num>
        <new/>
        <video><quality>HDTV</quality></video>
      </programme>
    </tv>"#;

    #[test]
    fn parses_channel_and_programme() {
        let (channels, programs) = parse(SAMPLE).unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].epg_id, "bbc1.uk");
        assert_eq!(channels[0].display_name, "BBC One");

        assert_eq!(programs.len(), 1);
        let p = &programs[0];
        assert_eq!(p.channel_key, "bbc1.uk");
        assert_eq!(p.title, "Evening News");
        assert_eq!(p.category.as_deref(), Some("News"));
        assert_eq!(p.secondary_category.as_deref(), Some("Politics"));
        assert_eq!(p.season_number, Some(1));
        assert_eq!(p.episode_number, Some(5));
        assert!(p.flag_new_episode);
        assert!(p.flag_hd);
    }

    #[test]
    fn programme_missing_times_is_dropped() {
        let xml = r#"<tv><programme channel="x"><title>No times</title></programme></tv>"#;
        let (_, programs) = parse(xml).unwrap();
        assert!(programs.is_empty());
    }

    #[test]
    fn offset_timestamps_convert_to_utc() {
        let xml = r#"<tv><programme start="20260101010000 +0100" stop="20260101020000 +0100" channel="x"><title>t</title></programme></tv>"#;
        let (_, programs) = parse(xml).unwrap();
        assert_eq!(programs[0].start.to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }
}

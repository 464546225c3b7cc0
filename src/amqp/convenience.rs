use lapin::{
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use std::borrow::{Borrow, Cow};

/// Convenience methods for [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    /// Lookup header by key.
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized;

    /// Lookup a header string value.
    ///
    /// Returns `None` if not a string.
    fn get_header_str<Q>(&self, key: &Q) -> Option<Cow<'_, str>>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key) {
            Some(AMQPValue::LongString(s)) => Some(String::from_utf8_lossy(s.as_bytes())),
            Some(AMQPValue::ShortString(s)) => Some(Cow::Borrowed(s.as_str())),
            _ => None,
        }
    }
}

impl BasicPropertiesExt for BasicProperties {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.headers().as_ref()?.inner().get(key)
    }
}

/// Set the value for a header inside a collection of AMQP properties.
///
/// `lapin` does not give mutable access to the headers of [`BasicProperties`], so they are
/// cloned. `properties` is consumed to make sure the caller does not re-use it under the
/// impression that it has been mutated.
///
/// # Example
///
/// ```rust
/// use carrot_stew::amqp::types::{AMQPValue, ShortString};
/// use carrot_stew::amqp::{BasicProperties, convenience::set_header};
///
/// let properties = BasicProperties::default();
/// let header_value = AMQPValue::LongString("eu-west-1".into());
///
/// let properties = set_header(properties, "region", header_value.clone());
///
/// let headers = properties.headers().as_ref().unwrap().inner();
/// let header_name: ShortString = "region".into();
/// assert_eq!(&header_value, headers.get(&header_name).unwrap());
/// ```
pub fn set_header(
    properties: BasicProperties,
    header_name: &str,
    header_value: AMQPValue,
) -> BasicProperties {
    let mut headers = properties.headers().clone().unwrap_or_default();
    headers.insert(header_name.into(), header_value);
    properties.with_headers(headers)
}
